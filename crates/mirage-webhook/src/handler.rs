//! Per-rule pod evaluation
//!
//! Walks init containers, then containers, in declaration order. The first
//! container using a disallowed tag denies the whole pod; every other
//! container whose image a rewrite rule matches gets a `replace` operation.

use json_patch::{PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Container, Pod};
use mirage_common::crd::RuleSpec;
use mirage_image::{is_tag_disallowed, Rewriter};
use tracing::info;

/// Outcome of evaluating a pod against a Rule
#[derive(Debug)]
pub enum Verdict {
    /// Reject the pod with the given reason
    Deny(String),
    /// Admit the pod with the given patch
    Allow {
        /// Image `replace` operations, in container order
        patch: Vec<PatchOperation>,
        /// Final image of every container, after rewriting
        images: Vec<String>,
    },
}

/// Ready-to-invoke mutation handler for one Rule
pub struct RuleHandler {
    rule: String,
    disallowed_tags: Vec<String>,
    rewriter: Rewriter,
    platform_affinity: bool,
}

impl RuleHandler {
    /// Build the handler for a Rule, compiling its rewrite rules
    pub fn new(rule: impl Into<String>, spec: &RuleSpec) -> Self {
        Self {
            rule: rule.into(),
            disallowed_tags: spec.disallowed_tags.clone(),
            rewriter: Rewriter::new(&spec.rules),
            platform_affinity: spec.platform_affinity,
        }
    }

    /// Name of the Rule this handler serves
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Tags this handler refuses
    pub fn disallowed_tags(&self) -> &[String] {
        &self.disallowed_tags
    }

    /// Whether admitted pods also get platform node affinity
    pub fn wants_platform_affinity(&self) -> bool {
        self.platform_affinity
    }

    /// Evaluate the pod's containers
    pub fn evaluate(&self, pod: &Pod) -> Verdict {
        let Some(spec) = pod.spec.as_ref() else {
            return Verdict::Allow {
                patch: vec![],
                images: vec![],
            };
        };

        let groups: [(&str, &[Container]); 2] = [
            ("initContainers", spec.init_containers.as_deref().unwrap_or_default()),
            ("containers", &spec.containers),
        ];

        let mut patch = Vec::new();
        let mut images = Vec::new();

        for (field, containers) in groups {
            for (index, container) in containers.iter().enumerate() {
                let Some(image) = container.image.as_deref() else {
                    continue;
                };

                if is_tag_disallowed(image, &self.disallowed_tags) {
                    return Verdict::Deny(format!(
                        "[{}] tags are not allowed in {}: {}",
                        self.disallowed_tags.join(" "),
                        field,
                        container.name
                    ));
                }

                match self.rewriter.rewrite(image) {
                    Some(rewritten) => {
                        info!(
                            rule = %self.rule,
                            pod = ?pod.metadata.name.as_ref().or(pod.metadata.generate_name.as_ref()),
                            namespace = ?pod.metadata.namespace,
                            container = %format!("{field}/{}", container.name),
                            source = %image,
                            rewrite = %rewritten,
                            "Rewriting image"
                        );
                        patch.push(PatchOperation::Replace(ReplaceOperation {
                            path: PointerBuf::from_tokens([
                                "spec".to_string(),
                                field.to_string(),
                                index.to_string(),
                                "image".to_string(),
                            ]),
                            value: serde_json::Value::String(rewritten.clone()),
                        }));
                        images.push(rewritten);
                    }
                    None => images.push(image.to_string()),
                }
            }
        }

        Verdict::Allow { patch, images }
    }
}
