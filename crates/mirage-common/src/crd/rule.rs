//! Rule CRD types
//!
//! A `Rule` describes how images of newly created pods are rewritten and
//! which tags are refused. Each Rule becomes one entry in the shared
//! mutating webhook configuration and one handler in the admission router.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an image rewrite Rule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mirage.dev",
    version = "v1",
    kind = "Rule",
    plural = "rules",
    status = "RuleStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Affinity","type":"boolean","jsonPath":".spec.platformAffinity"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Ordered rewrite rules; the first match wins
    #[serde(default)]
    pub rules: Vec<RewriteRule>,

    /// Tags that pods selected by this Rule may not use
    #[serde(default)]
    pub disallowed_tags: Vec<String>,

    /// Namespaces the webhook entry applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Pods the webhook entry applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// Constrain pods to nodes whose platform every container image supports
    #[serde(default)]
    pub platform_affinity: bool,

    /// Overrides for the generated webhook entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutating_webhook: Option<MutatingWebhookOverrides>,
}

/// One image rewrite rule
///
/// `registry` is an exact prefix match (`<registry>/...`), `regex` a pattern
/// whose captures can be referenced from `replacement` as `$1`, `${name}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRule {
    /// Registry prefix to replace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// Regular expression matched against the normalized image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Replacement registry or regex template
    pub replacement: String,
}

/// Overrides applied to the generated `MutatingWebhook`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutatingWebhookOverrides {
    /// Failure policy, `Ignore` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Side-effect class, `None` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffects>,

    /// Webhook call timeout in seconds, 5 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

/// Admission webhook failure policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the pod unchanged when the webhook fails
    #[default]
    Ignore,
    /// Reject the pod when the webhook fails
    Fail,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ignore => write!(f, "Ignore"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

/// Admission webhook side-effect class
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SideEffects {
    /// The webhook has no side effects
    #[default]
    None,
    /// The webhook has no side effects on dry-run requests
    NoneOnDryRun,
}

impl std::fmt::Display for SideEffects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::NoneOnDryRun => write!(f, "NoneOnDryRun"),
        }
    }
}

/// Status of a Rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatus {
    /// Current phase
    #[serde(default)]
    pub phase: RulePhase,

    /// Validation or sync message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Lifecycle phase of a Rule
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RulePhase {
    /// Not yet processed
    #[default]
    Pending,
    /// Handler registered and webhook entry in place
    Ready,
    /// Rejected by validation; no handler or webhook entry exists
    Invalid,
}

impl std::fmt::Display for RulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Invalid => write!(f, "Invalid"),
        }
    }
}

impl RuleSpec {
    /// Validate the rule spec.
    ///
    /// Regexes that fail to compile are not an error here; see [`Self::warnings`].
    pub fn validate(&self) -> Result<(), String> {
        if self.rules.is_empty() && self.disallowed_tags.is_empty() {
            return Err("`rules` and `disallowedTags` cannot both be empty".to_string());
        }

        for (i, rule) in self.rules.iter().enumerate() {
            let registry = rule.registry.as_deref().unwrap_or_default();
            let regex = rule.regex.as_deref().unwrap_or_default();

            if registry.is_empty() && regex.is_empty() {
                return Err(format!("rules[{i}] needs either `registry` or `regex`"));
            }
        }

        if let Some(timeout) = self.mutating_webhook.as_ref().and_then(|w| w.timeout_seconds) {
            if !(1..=30).contains(&timeout) {
                return Err(format!(
                    "mutatingWebhook.timeoutSeconds must be between 1 and 30, got {timeout}"
                ));
            }
        }

        Ok(())
    }

    /// Problems that leave the Rule usable: regexes that fail to compile.
    ///
    /// Rewriting skips such entries.
    pub fn warnings(&self) -> Vec<String> {
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| {
                let regex = rule.regex.as_deref().filter(|r| !r.is_empty())?;
                regex::Regex::new(regex)
                    .err()
                    .map(|e| format!("rules[{i}]: failed to compile regexp {regex}: {e}"))
            })
            .collect()
    }
}
