//! Helpers around kube-rs API calls

use kube::api::{Api, Patch, PatchParams};
use kube::Client;

/// Whether an API error is an optimistic-concurrency conflict (HTTP 409)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether an API error means the object does not exist (HTTP 404)
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Patch the status sub-resource of a cluster-scoped resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_cluster_resource_status<T>(
    client: &Client,
    name: &str,
    status: &impl serde::Serialize,
) -> Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Build a status merge patch guarded by `resourceVersion`.
///
/// The API server rejects the write with a conflict when the stored object
/// moved past `resource_version`, which turns a merge patch into a full
/// status replacement with optimistic concurrency.
pub fn versioned_status_patch(
    resource_version: Option<&str>,
    status: &impl serde::Serialize,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    })
}
