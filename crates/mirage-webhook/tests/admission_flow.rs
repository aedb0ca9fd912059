//! End-to-end admission requests through the HTTP router

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use mirage_common::crd::{RewriteRule, RuleSpec};
use mirage_image::{AffinityBuilder, ImageError, ManifestSource, Platform, PlatformResolver};
use mirage_webhook::handler::RuleHandler;
use mirage_webhook::{webhook_router, RoutingTable, WebhookState};
use serde_json::{json, Value};
use tower::ServiceExt;

struct MultiArchRegistry;

#[async_trait::async_trait]
impl ManifestSource for MultiArchRegistry {
    async fn platforms(&self, reference: &str) -> Result<Vec<Platform>, ImageError> {
        if reference.contains("amd64-only") {
            Ok(vec![Platform::new("linux", "amd64")])
        } else {
            Ok(vec![
                Platform::new("linux", "amd64"),
                Platform::new("linux", "arm64"),
            ])
        }
    }
}

fn state() -> Arc<WebhookState> {
    let resolver = Arc::new(PlatformResolver::new(Arc::new(MultiArchRegistry)));
    Arc::new(WebhookState {
        routes: Arc::new(RoutingTable::new()),
        affinity: Arc::new(AffinityBuilder::new(resolver)),
    })
}

fn review(pod_spec: Value) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": "CREATE",
            "namespace": "apps",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"generateName": "web-", "namespace": "apps"},
                "spec": pod_spec
            }
        }
    })
}

async fn post(router: axum::Router, rule: &str, body: Value) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/mutate-pod/{rule}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request building should succeed");

    let response = router
        .oneshot(request)
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body reading should succeed");
    serde_json::from_slice(&bytes).expect("response should be JSON")
}

fn decoded_patch(review: &Value) -> Vec<Value> {
    match review["response"]["patch"].as_str() {
        Some(encoded) => {
            let bytes = STANDARD.decode(encoded).expect("patch should be base64");
            serde_json::from_slice(&bytes).expect("patch should be JSON")
        }
        None => vec![],
    }
}

fn mirror_rule(platform_affinity: bool) -> RuleHandler {
    RuleHandler::new(
        "mirror-hub",
        &RuleSpec {
            rules: vec![
                RewriteRule {
                    registry: None,
                    regex: Some("^docker.io/internal/(.+)$".to_string()),
                    replacement: "registry.corp/internal/$1".to_string(),
                },
                RewriteRule {
                    registry: Some("docker.io".to_string()),
                    regex: None,
                    replacement: "mirror.corp/hub".to_string(),
                },
            ],
            disallowed_tags: vec!["latest".to_string()],
            platform_affinity,
            ..Default::default()
        },
    )
}

/// Story: a Rule is deleted while the API server still routes to it; pods
/// keep being admitted unchanged.
#[tokio::test]
async fn unknown_rule_path_admits_unchanged() {
    let state = state();
    let router = webhook_router(state);

    let response = post(
        router,
        "removed-rule",
        review(json!({"containers": [{"name": "app", "image": "nginx:latest"}]})),
    )
    .await;

    assert_eq!(response["response"]["allowed"], true);
    assert!(response["response"]["patch"].is_null());
    assert_eq!(response["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
}

/// Story: the first matching rewrite wins, and init containers are patched
/// before regular ones.
#[tokio::test]
async fn rewrites_follow_rule_order_and_container_order() {
    let state = state();
    state.routes.upsert("mirror-hub", mirror_rule(false));
    let router = webhook_router(state);

    let response = post(
        router,
        "mirror-hub",
        review(json!({
            "initContainers": [{"name": "migrate", "image": "internal/migrate:3"}],
            "containers": [
                {"name": "app", "image": "nginx:1.27"},
                {"name": "metrics", "image": "quay.io/prometheus/node-exporter:v1"}
            ]
        })),
    )
    .await;

    assert_eq!(response["response"]["allowed"], true);
    assert_eq!(
        decoded_patch(&response),
        vec![
            json!({"op": "replace", "path": "/spec/initContainers/0/image", "value": "registry.corp/internal/migrate:3"}),
            json!({"op": "replace", "path": "/spec/containers/0/image", "value": "mirror.corp/hub/library/nginx:1.27"}),
        ]
    );
}

/// Story: an implicit `latest` tag is refused and nothing is patched.
#[tokio::test]
async fn implicit_latest_tag_is_denied() {
    let state = state();
    state.routes.upsert("mirror-hub", mirror_rule(false));
    let router = webhook_router(state);

    let response = post(
        router,
        "mirror-hub",
        review(json!({"containers": [{"name": "app", "image": "nginx"}]})),
    )
    .await;

    assert_eq!(response["response"]["allowed"], false);
    assert_eq!(
        response["response"]["status"]["message"],
        "[latest] tags are not allowed in containers: app"
    );
    assert!(response["response"]["patch"].is_null());
}

/// Story: platform affinity narrows scheduling to the architectures every
/// container image supports.
#[tokio::test]
async fn affinity_uses_intersection_of_rewritten_images() {
    let state = state();
    state.routes.upsert("mirror-hub", mirror_rule(true));
    let router = webhook_router(state);

    let response = post(
        router,
        "mirror-hub",
        review(json!({"containers": [
            {"name": "app", "image": "nginx:1.27"},
            {"name": "agent", "image": "quay.io/amd64-only/agent:2"}
        ]})),
    )
    .await;

    let patch = decoded_patch(&response);
    let affinity = patch
        .iter()
        .find(|op| op["path"] == "/spec/affinity")
        .expect("affinity op");
    let expressions =
        &affinity["value"]["nodeAffinity"]["requiredDuringSchedulingIgnoredDuringExecution"]
            ["nodeSelectorTerms"][0]["matchExpressions"];

    assert_eq!(
        expressions[0],
        json!({"key": "kubernetes.io/arch", "operator": "In", "values": ["amd64"]})
    );
    assert_eq!(
        expressions[1],
        json!({"key": "kubernetes.io/os", "operator": "In", "values": ["linux"]})
    );
    assert!(patch
        .iter()
        .any(|op| op["path"] == "/metadata/annotations"));
}

#[tokio::test]
async fn healthz_responds() {
    let router = webhook_router(state());
    let request = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .expect("request building should succeed");

    let response = router
        .oneshot(request)
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);
}
