//! Mirror status synchronization
//!
//! Three writers touch a Mirror's status: Job creation, Job-status events
//! and Pod-status events. Whole-status writes carry the `resourceVersion`
//! they were computed from; per-image writes are a single JSON patch on
//! `/status/images/<index>` guarded by a `test` on the entry's source.
//! Either kind of stale write is retried from a fresh read.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use json_patch::{PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use mirage_common::crd::{
    is_condition_true, upsert_condition, Condition, ConditionStatus, ImageStatus, Mirror, MirrorStatus,
    CONDITION_JOB_CREATED, IMAGE_PHASE_PENDING,
};
use mirage_common::kube_utils::versioned_status_patch;
use mirage_common::retry::{retry_with_backoff_if, RetryConfig};
use mirage_common::{COMPLETION_INDEX_LABEL, MIRROR_ANNOTATION};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::MirrorError;
use crate::job::ExpandedImage;

/// Fallback message for Job conditions that carry none
const NO_MESSAGE: &str = "no message";

/// Copy Job counters and conditions into a Mirror status.
///
/// Job condition types are prefixed with `Job`, so `Complete` becomes
/// `JobComplete`. An empty reason falls back to the condition type.
pub fn fold_job_status(status: &mut MirrorStatus, job: &JobStatus) {
    status.running = job.active.unwrap_or(0);
    status.failed = job.failed.unwrap_or(0);
    status.succeeded = job.succeeded.unwrap_or(0);

    for jc in job.conditions.iter().flatten() {
        let reason = jc
            .reason
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| jc.type_.clone());
        let message = jc
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| NO_MESSAGE.to_string());

        let mut condition = Condition::new(
            format!("Job{}", jc.type_),
            ConditionStatus::from(jc.status.as_str()),
            reason,
            message,
        );
        if let Some(time) = &jc.last_transition_time {
            condition.last_transition_time = time.0;
        }
        upsert_condition(&mut status.conditions, condition);
    }
}

/// Completion index of a mirror pod, from the label the Job controller sets
pub fn pod_completion_index(pod: &Pod) -> Option<usize> {
    pod.labels()
        .get(COMPLETION_INDEX_LABEL)
        .and_then(|index| index.parse().ok())
}

/// Name of the Mirror a pod works for
pub fn pod_mirror(pod: &Pod) -> Option<&str> {
    pod.annotations().get(MIRROR_ANNOTATION).map(String::as_str)
}

/// New state of an image entry after observing its pod.
///
/// Source and target are kept from the existing entry. The transition time
/// only moves when the phase changes.
pub fn image_status_from_pod(existing: &ImageStatus, pod: &Pod, now: DateTime<Utc>) -> ImageStatus {
    let pod_status = pod.status.as_ref();
    let phase = pod_status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| IMAGE_PHASE_PENDING.to_string());
    let last_transition_time = if phase == existing.phase {
        existing.last_transition_time
    } else {
        now
    };

    ImageStatus {
        source: existing.source.clone(),
        target: existing.target.clone(),
        phase,
        last_transition_time,
        message: pod_status.and_then(|s| s.message.clone()),
        pod: Some(pod.name_any()),
    }
}

/// JSON patch replacing exactly one image entry.
///
/// The `test` on the entry's source makes the write fail instead of landing
/// on a different image when the list changed underneath.
pub fn image_status_patch(
    index: usize,
    existing: &ImageStatus,
    updated: &ImageStatus,
) -> Result<Vec<PatchOperation>, MirrorError> {
    let entry = ["status".to_string(), "images".to_string(), index.to_string()];
    let mut source = entry.to_vec();
    source.push("source".to_string());

    Ok(vec![
        PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(source),
            value: serde_json::Value::String(existing.source.clone()),
        }),
        PatchOperation::Replace(ReplaceOperation {
            path: PointerBuf::from_tokens(entry),
            value: serde_json::to_value(updated)?,
        }),
    ])
}

/// One `Pending` entry per expanded image, in completion-index order
pub fn initial_images(images: &[ExpandedImage]) -> Vec<ImageStatus> {
    images
        .iter()
        .map(|image| ImageStatus::pending(&image.source, &image.target))
        .collect()
}

/// Record the outcome of Job creation.
///
/// Success also seeds `images`; a failure leaves them untouched. A repeated
/// success is a no-op so progress already recorded is never reset.
pub fn record_job_created(status: &mut MirrorStatus, outcome: Result<&[ExpandedImage], &str>) {
    if outcome.is_ok() && is_condition_true(&status.conditions, CONDITION_JOB_CREATED) {
        return;
    }

    let condition = match outcome {
        Ok(images) => {
            status.images = initial_images(images);
            Condition::new(
                CONDITION_JOB_CREATED,
                ConditionStatus::True,
                "JobCreated",
                "Job created successfully",
            )
        }
        Err(message) => Condition::new(
            CONDITION_JOB_CREATED,
            ConditionStatus::False,
            "JobCreateFailed",
            message,
        ),
    };
    upsert_condition(&mut status.conditions, condition);
}

/// Storage of Mirror status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MirrorStatusStore: Send + Sync {
    /// Current state of the Mirror
    async fn get(&self, namespace: &str, name: &str) -> Result<Mirror, MirrorError>;

    /// Apply a merge patch to the status sub-resource
    async fn merge_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), MirrorError>;

    /// Apply a JSON patch to the status sub-resource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        ops: Vec<PatchOperation>,
    ) -> Result<(), MirrorError>;
}

/// [`MirrorStatusStore`] backed by the Kubernetes API
pub struct KubeMirrorStatusStore {
    client: Client,
}

impl KubeMirrorStatusStore {
    /// Create a store using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Mirror> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MirrorStatusStore for KubeMirrorStatusStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Mirror, MirrorError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn merge_status(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), MirrorError> {
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        ops: Vec<PatchOperation>,
    ) -> Result<(), MirrorError> {
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Json::<()>(json_patch::Patch(ops)),
            )
            .await?;
        Ok(())
    }
}

/// Writes Job and Pod observations into Mirror status
pub struct MirrorStatusSynchronizer {
    store: Arc<dyn MirrorStatusStore>,
    retry: RetryConfig,
}

impl MirrorStatusSynchronizer {
    /// Create a synchronizer writing through `store` with the bounded conflict backoff
    pub fn new(store: Arc<dyn MirrorStatusStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::conflict(),
        }
    }

    /// Re-read the Mirror, apply `update` to its status and write the whole
    /// status back, retrying stale writes. Nothing is written when `update`
    /// leaves the status unchanged.
    async fn update_status<F>(
        &self,
        namespace: &str,
        name: &str,
        operation: &str,
        update: F,
    ) -> Result<(), MirrorError>
    where
        F: Fn(&mut MirrorStatus),
    {
        let store = &self.store;
        let update = &update;

        retry_with_backoff_if(&self.retry, operation, MirrorError::is_stale_write, || async move {
            let mirror = store.get(namespace, name).await?;
            let mut status = mirror.status.clone().unwrap_or_default();
            update(&mut status);
            if mirror.status.as_ref() == Some(&status) {
                return Ok(());
            }

            let patch = versioned_status_patch(mirror.resource_version().as_deref(), &status);
            store.merge_status(namespace, name, patch).await
        })
        .await
    }

    /// Fold a Job's status into its Mirror
    pub async fn sync_job(
        &self,
        namespace: &str,
        mirror: &str,
        job: &JobStatus,
    ) -> Result<(), MirrorError> {
        debug!(mirror = %mirror, namespace = %namespace, "Syncing job status");
        self.update_status(namespace, mirror, "sync mirror job status", |status| {
            fold_job_status(status, job)
        })
        .await
    }

    /// Record Job creation, seeding one `Pending` image entry per index on success
    pub async fn record_job_created(
        &self,
        namespace: &str,
        mirror: &str,
        outcome: Result<&[ExpandedImage], &str>,
    ) -> Result<(), MirrorError> {
        self.update_status(namespace, mirror, "record mirror job creation", |status| {
            record_job_created(status, outcome)
        })
        .await
    }

    /// Overwrite the image entry of the pod's completion index.
    ///
    /// Pods without a completion index are ignored.
    pub async fn sync_pod(
        &self,
        namespace: &str,
        mirror: &str,
        pod: &Pod,
    ) -> Result<(), MirrorError> {
        let Some(index) = pod_completion_index(pod) else {
            debug!(pod = %pod.name_any(), "Pod has no completion index yet, skipping");
            return Ok(());
        };
        let store = &self.store;

        retry_with_backoff_if(
            &self.retry,
            "sync mirror image status",
            MirrorError::is_stale_write,
            || async move {
                let current = store.get(namespace, mirror).await?;
                let existing = current
                    .status
                    .as_ref()
                    .and_then(|s| s.images.get(index))
                    .ok_or_else(|| MirrorError::IndexOutOfRange {
                        mirror: mirror.to_string(),
                        index,
                    })?;

                let updated = image_status_from_pod(existing, pod, Utc::now());
                if &updated == existing {
                    return Ok(());
                }

                info!(
                    mirror = %mirror,
                    index,
                    image = %updated.source,
                    phase = %updated.phase,
                    "Updating image status"
                );
                let ops = image_status_patch(index, existing, &updated)?;
                store.patch_status(namespace, mirror, ops).await
            },
        )
        .await
    }
}
