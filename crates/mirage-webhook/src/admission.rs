//! Pod mutation endpoint
//!
//! One listener serves every Rule. The path segment after
//! [`WEBHOOK_PATH_PREFIX`] names the Rule; the handler for it is looked up in
//! the [`RoutingTable`] on every request.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use mirage_image::AffinityBuilder;
use tracing::{debug, error, info};

use crate::handler::Verdict;
use crate::routing::RoutingTable;

/// Path prefix under which every Rule is served
pub const WEBHOOK_PATH_PREFIX: &str = "/mutate-pod/";

/// Shared state of the admission server
pub struct WebhookState {
    /// Live Rule handlers
    pub routes: Arc<RoutingTable>,
    /// Builds platform node affinity for Rules that ask for it
    pub affinity: Arc<AffinityBuilder>,
}

/// Build the admission router
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate-pod/{rule}", post(mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a mutating admission review for a Pod on behalf of `rule`
async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Path(rule): Path<String>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(rule = %rule, error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(admit_pod(&state, &rule, &req).await.into_review())
}

/// Evaluate one admission request against the named Rule
pub async fn admit_pod(
    state: &WebhookState,
    rule: &str,
    req: &AdmissionRequest<Pod>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(handler) = state.routes.lookup(rule) else {
        debug!(uid = %req.uid, rule = %rule, "No handler for rule, allowing unchanged");
        return response;
    };

    let Some(pod) = req.object.as_ref() else {
        debug!(uid = %req.uid, rule = %rule, "No pod in request, allowing unchanged");
        return response;
    };

    let patch: Vec<PatchOperation> = match handler.evaluate(pod) {
        Verdict::Deny(reason) => {
            info!(
                uid = %req.uid,
                rule = %rule,
                namespace = ?req.namespace,
                reason = %reason,
                "Denying pod"
            );
            return response.deny(reason);
        }
        Verdict::Allow { mut patch, images } => {
            if handler.wants_platform_affinity() {
                patch.extend(state.affinity.build_patch(pod, &images).await);
            }
            patch
        }
    };

    if patch.is_empty() {
        return response;
    }

    debug!(uid = %req.uid, rule = %rule, operations = patch.len(), "Patching pod");
    match response.clone().with_patch(json_patch::Patch(patch)) {
        Ok(patched) => patched,
        Err(e) => {
            error!(uid = %req.uid, rule = %rule, error = %e, "Failed to serialize patch, allowing unchanged");
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RuleHandler;
    use mirage_common::crd::{RewriteRule, RuleSpec};
    use mirage_image::{ImageError, ManifestSource, Platform, PlatformResolver};
    use serde_json::{json, Value};

    struct NoRegistry;

    #[async_trait::async_trait]
    impl ManifestSource for NoRegistry {
        async fn platforms(&self, reference: &str) -> Result<Vec<Platform>, ImageError> {
            Err(ImageError::Registry {
                reference: reference.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    struct FixedRegistry;

    #[async_trait::async_trait]
    impl ManifestSource for FixedRegistry {
        async fn platforms(&self, _reference: &str) -> Result<Vec<Platform>, ImageError> {
            Ok(vec![Platform::new("linux", "amd64"), Platform::new("linux", "arm64")])
        }
    }

    fn state(source: Arc<dyn ManifestSource>) -> WebhookState {
        WebhookState {
            routes: Arc::new(RoutingTable::new()),
            affinity: Arc::new(AffinityBuilder::new(Arc::new(PlatformResolver::new(source)))),
        }
    }

    fn request(containers: Value) -> AdmissionRequest<Pod> {
        let review: AdmissionReview<Pod> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0df28fbd-5f5f-11e8-bc74-36e6bb280816",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "namespace": "default",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"},
                    "spec": {"containers": containers}
                }
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn hub_rule(platform_affinity: bool) -> RuleHandler {
        RuleHandler::new(
            "hub",
            &RuleSpec {
                rules: vec![RewriteRule {
                    registry: Some("docker.io".to_string()),
                    regex: None,
                    replacement: "mirror.local".to_string(),
                }],
                disallowed_tags: vec!["dev".to_string()],
                platform_affinity,
                ..Default::default()
            },
        )
    }

    fn patch_of(response: &AdmissionResponse) -> Vec<Value> {
        match &response.patch {
            Some(bytes) => serde_json::from_slice(bytes).unwrap(),
            None => vec![],
        }
    }

    #[tokio::test]
    async fn missing_rule_fails_open() {
        let state = state(Arc::new(NoRegistry));
        let req = request(json!([{"name": "app", "image": "nginx"}]));

        let response = admit_pod(&state, "deleted-rule", &req).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn rewrites_matching_images() {
        let state = state(Arc::new(NoRegistry));
        state.routes.upsert("hub", hub_rule(false));
        let req = request(json!([
            {"name": "app", "image": "nginx:1.25"},
            {"name": "sidecar", "image": "gcr.io/proxy:1"}
        ]));

        let response = admit_pod(&state, "hub", &req).await;
        assert!(response.allowed);
        assert_eq!(
            patch_of(&response),
            vec![json!({
                "op": "replace",
                "path": "/spec/containers/0/image",
                "value": "mirror.local/library/nginx:1.25"
            })]
        );
    }

    #[tokio::test]
    async fn disallowed_tag_denies_request() {
        let state = state(Arc::new(NoRegistry));
        state.routes.upsert("hub", hub_rule(false));
        let req = request(json!([{"name": "app", "image": "nginx:dev"}]));

        let response = admit_pod(&state, "hub", &req).await;
        assert!(!response.allowed);
        assert_eq!(
            response.result.message,
            "[dev] tags are not allowed in containers: app"
        );
    }

    #[tokio::test]
    async fn resolution_failure_leaves_only_rewrites() {
        let state = state(Arc::new(NoRegistry));
        state.routes.upsert("hub", hub_rule(true));
        let req = request(json!([{"name": "app", "image": "nginx:1.25"}]));

        let response = admit_pod(&state, "hub", &req).await;
        assert!(response.allowed);
        assert_eq!(patch_of(&response).len(), 1);
    }

    #[tokio::test]
    async fn platform_affinity_appends_node_affinity() {
        let state = state(Arc::new(FixedRegistry));
        state.routes.upsert("hub", hub_rule(true));
        let req = request(json!([{"name": "app", "image": "nginx:1.25"}]));

        let response = admit_pod(&state, "hub", &req).await;
        let ops = patch_of(&response);
        let paths: Vec<&str> = ops.iter().filter_map(|op| op["path"].as_str()).collect();

        assert!(paths.contains(&"/spec/containers/0/image"));
        assert!(paths.contains(&"/spec/affinity"));
    }

    #[tokio::test]
    async fn untouched_pod_has_no_patch() {
        let state = state(Arc::new(NoRegistry));
        state.routes.upsert("hub", hub_rule(false));
        let req = request(json!([{"name": "app", "image": "quay.io/org/app:2"}]));

        let response = admit_pod(&state, "hub", &req).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
