//! Mirror CRD types
//!
//! A `Mirror` copies a list of images (optionally fanned out over tags) from
//! one registry to another with a single indexed Job. `status.images` holds
//! one entry per completion index, in expansion order.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ResourceRequirements, SecretVolumeSource};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// Default number of images mirrored concurrently
pub const DEFAULT_PARALLELISM: i32 = 5;

/// Default deadline for each mirror pod
pub const DEFAULT_ACTIVE_DEADLINE_SECONDS: i64 = 3600;

/// Phase of an image whose pod has not reported yet
pub const IMAGE_PHASE_PENDING: &str = "Pending";

/// Condition recording the outcome of Job creation
pub const CONDITION_JOB_CREATED: &str = "JobCreated";

/// Job `Complete` condition as folded into the Mirror
pub const CONDITION_JOB_COMPLETE: &str = "JobComplete";

/// Job `Failed` condition as folded into the Mirror
pub const CONDITION_JOB_FAILED: &str = "JobFailed";

/// `[registry[:port]/]path[:tag][@digest]`, as accepted by container registries
static IMAGE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*",
        r"(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?",
        r"(?:@[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,})?$",
    ))
    .expect("image reference pattern compiles")
});

static IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern compiles"));

/// `os/arch[/variant]`
static PLATFORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+/[a-z0-9_]+(?:/[a-z0-9.]+)?$").expect("platform pattern compiles")
});

fn default_parallelism() -> i32 {
    DEFAULT_PARALLELISM
}

fn default_active_deadline_seconds() -> i64 {
    DEFAULT_ACTIVE_DEADLINE_SECONDS
}

/// Specification for a Mirror
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mirage.dev",
    version = "v1",
    kind = "Mirror",
    plural = "mirrors",
    namespaced,
    status = "MirrorStatus",
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.running"}"#,
    printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.failed"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"integer","jsonPath":".status.succeeded"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSpec {
    /// Image groups to mirror
    pub images: Vec<MirrorImage>,

    /// Number of images mirrored concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,

    /// Resources for the pull and push containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Size limit of the scratch volume holding the image tarball
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<Quantity>,

    /// Node selector for mirror pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Deadline for each mirror pod
    #[serde(default = "default_active_deadline_seconds")]
    pub active_deadline_seconds: i64,

    /// Registry credentials, a secret of type `kubernetes.io/dockerconfigjson`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_config: Option<SecretVolumeSource>,

    /// Pass `-v` to the transfer tool
    #[serde(default)]
    pub verbose: bool,

    /// Annotate pushed images with their source reference
    #[serde(default)]
    pub set_source_annotation: bool,

    /// HTTP(S) proxy for registry traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,

    /// Also use the proxy when pushing
    #[serde(default)]
    pub push_use_proxy: bool,
}

/// One source/target image pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorImage {
    /// Source repository (or full reference when `tags` is empty)
    pub source: String,

    /// Target repository (or full reference when `tags` is empty)
    pub target: String,

    /// Tags to mirror; each becomes its own completion index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Platforms to copy, e.g. `linux/amd64`; all when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
}

/// Status of a Mirror
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStatus {
    /// Condition history (JobCreated plus the folded Job conditions)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-image status, indexed by Job completion index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageStatus>,

    /// Pods currently running
    #[serde(default)]
    pub running: i32,

    /// Pods that failed
    #[serde(default)]
    pub failed: i32,

    /// Pods that succeeded
    #[serde(default)]
    pub succeeded: i32,
}

/// Status of one expanded image
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Source reference
    pub source: String,

    /// Target reference
    pub target: String,

    /// Phase, mirroring the owning pod's phase
    pub phase: String,

    /// When the phase was last observed
    pub last_transition_time: DateTime<Utc>,

    /// Pod status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Name of the pod mirroring this image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
}

impl ImageStatus {
    /// A freshly created, not yet scheduled entry
    pub fn pending(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            phase: IMAGE_PHASE_PENDING.to_string(),
            last_transition_time: Utc::now(),
            message: None,
            pod: None,
        }
    }
}

impl MirrorSpec {
    /// Validate the mirror spec
    pub fn validate(&self) -> Result<(), String> {
        if self.images.is_empty() {
            return Err("`images` cannot be empty".to_string());
        }
        for (i, image) in self.images.iter().enumerate() {
            if image.source.trim().is_empty() || image.target.trim().is_empty() {
                return Err(format!("images[{i}] needs both `source` and `target`"));
            }
            if image.tags.iter().any(|t| t.trim().is_empty()) {
                return Err(format!("images[{i}] has an empty tag"));
            }
            for reference in [&image.source, &image.target] {
                if !IMAGE_REFERENCE.is_match(reference) {
                    return Err(format!("images[{i}]: '{reference}' is not an image reference"));
                }
            }
            if let Some(tag) = image.tags.iter().find(|t| !IMAGE_TAG.is_match(t)) {
                return Err(format!("images[{i}]: '{tag}' is not a valid tag"));
            }
            if let Some(platform) = image.platforms.iter().find(|p| !PLATFORM.is_match(p)) {
                return Err(format!("images[{i}]: '{platform}' is not an os/arch platform"));
            }
        }
        if self.parallelism < 1 {
            return Err(format!(
                "`parallelism` must be at least 1, got {}",
                self.parallelism
            ));
        }
        Ok(())
    }
}
