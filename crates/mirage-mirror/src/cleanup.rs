//! Removal of finished Mirrors
//!
//! A Mirror is finished once its Job's `Complete` or `Failed` condition has
//! been folded in as `True`. Finished Mirrors are deleted after a retention
//! period; their Jobs and pods follow through owner references.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use mirage_common::crd::{
    find_condition, ConditionStatus, Mirror, MirrorStatus, CONDITION_JOB_COMPLETE,
    CONDITION_JOB_FAILED,
};
use mirage_common::kube_utils::is_not_found;
use tracing::{debug, info, warn};

use crate::error::MirrorError;

/// When the Mirror finished, if it has
pub fn finished_at(status: &MirrorStatus) -> Option<DateTime<Utc>> {
    [CONDITION_JOB_COMPLETE, CONDITION_JOB_FAILED]
        .into_iter()
        .filter_map(|type_| find_condition(&status.conditions, type_))
        .filter(|c| c.status == ConditionStatus::True)
        .map(|c| c.last_transition_time)
        .min()
}

/// Whether a Mirror finished longer than `retention` ago
pub fn should_clean(status: Option<&MirrorStatus>, now: DateTime<Utc>, retention: Duration) -> bool {
    let Some(finished) = status.and_then(finished_at) else {
        return false;
    };
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return false;
    };
    now - finished > retention
}

/// Delete every finished Mirror past retention, returning how many went
pub async fn clean_finished(client: &Client, retention: Duration) -> Result<usize, MirrorError> {
    let mirrors: Api<Mirror> = Api::all(client.clone());
    let now = Utc::now();
    let mut deleted = 0;

    for mirror in mirrors.list(&ListParams::default()).await? {
        if !should_clean(mirror.status.as_ref(), now, retention) {
            continue;
        }
        let name = mirror.name_any();
        let Some(namespace) = mirror.namespace() else {
            continue;
        };

        let api: Api<Mirror> = Api::namespaced(client.clone(), &namespace);
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(mirror = %name, namespace = %namespace, "Deleted finished mirror");
                deleted += 1;
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                warn!(mirror = %name, namespace = %namespace, error = %e, "Failed to delete finished mirror")
            }
        }
    }

    Ok(deleted)
}

/// Periodically delete finished Mirrors
pub async fn run_cleanup(client: Client, interval: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = interval.as_secs(),
        retention_secs = retention.as_secs(),
        "Mirror cleanup started"
    );

    loop {
        ticker.tick().await;
        match clean_finished(&client, retention).await {
            Ok(deleted) => debug!(deleted, "Mirror cleanup pass done"),
            Err(e) => warn!(error = %e, "Mirror cleanup pass failed"),
        }
    }
}
