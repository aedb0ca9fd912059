//! Platform-aware node affinity
//!
//! Resolves the platforms of every container image in a pod, intersects
//! them, and requires nodes whose `kubernetes.io/os` and `kubernetes.io/arch`
//! labels fall inside the intersection. Resolution shares one deadline for the
//! whole pod; images that fail or time out are left out of the intersection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
};
use mirage_common::PLATFORM_AFFINITY_ANNOTATION;
use tracing::{debug, warn};

use crate::platform::{Platform, PlatformResolver};

/// Budget for resolving all images of one pod
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Node label holding the CPU architecture
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Node label holding the operating system
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Builds node-affinity patches from the platforms a pod's images share
pub struct AffinityBuilder {
    resolver: Arc<PlatformResolver>,
    timeout: Duration,
}

impl AffinityBuilder {
    /// Create a builder with the default 5 second resolution budget
    pub fn new(resolver: Arc<PlatformResolver>) -> Self {
        Self::with_timeout(resolver, DEFAULT_RESOLUTION_TIMEOUT)
    }

    /// Create a builder with a custom resolution budget
    pub fn with_timeout(resolver: Arc<PlatformResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Platforms supported by every image that resolved within the budget.
    ///
    /// Lookups run concurrently against one shared deadline; lookups still in
    /// flight when it passes are dropped.
    pub async fn common_platforms(&self, images: &[String]) -> Vec<Platform> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        let lookups = images.iter().map(|image| async move {
            match tokio::time::timeout_at(deadline, self.resolver.resolve(image)).await {
                Ok(Ok(platforms)) => Some(platforms),
                Ok(Err(e)) => {
                    warn!(image = %image, error = %e, "Failed to resolve image platforms");
                    None
                }
                Err(_) => {
                    warn!(image = %image, "Timed out resolving image platforms");
                    None
                }
            }
        });

        let resolved: Vec<Vec<Platform>> = join_all(lookups).await.into_iter().flatten().collect();
        intersect_platforms(&resolved)
    }

    /// JSON patch operations constraining `pod` to nodes that can run `images`.
    ///
    /// `images` are the pod's final (rewritten) images. Returns no operations
    /// when the pod already carries the affinity annotation or when the images
    /// share no platform.
    pub async fn build_patch(&self, pod: &Pod, images: &[String]) -> Vec<PatchOperation> {
        let already_processed = pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(PLATFORM_AFFINITY_ANNOTATION));
        if already_processed {
            debug!(pod = ?pod.metadata.name, "Pod already has platform affinity, skipping");
            return vec![];
        }

        let platforms = self.common_platforms(images).await;
        affinity_patch(pod, &platforms)
    }
}

/// Intersection of platform lists by canonical key.
///
/// Order follows first occurrence in the first list. An empty input yields
/// an empty intersection.
pub fn intersect_platforms(sets: &[Vec<Platform>]) -> Vec<Platform> {
    let Some((first, rest)) = sets.split_first() else {
        return vec![];
    };

    let others: Vec<HashSet<String>> = rest
        .iter()
        .map(|set| set.iter().map(Platform::key).collect())
        .collect();

    let mut seen = HashSet::new();
    first
        .iter()
        .filter(|p| seen.insert(p.key()))
        .filter(|p| {
            let key = p.key();
            others.iter().all(|set| set.contains(&key))
        })
        .cloned()
        .collect()
}

/// `kubernetes.io/arch` and `kubernetes.io/os` requirements for the platforms
pub fn node_selector_requirements(platforms: &[Platform]) -> Vec<NodeSelectorRequirement> {
    let mut architectures: Vec<String> = Vec::new();
    let mut systems: Vec<String> = Vec::new();
    for platform in platforms {
        let arch = platform.node_architecture().to_string();
        if !architectures.contains(&arch) {
            architectures.push(arch);
        }
        if !systems.contains(&platform.os) {
            systems.push(platform.os.clone());
        }
    }

    vec![
        NodeSelectorRequirement {
            key: ARCH_LABEL.to_string(),
            operator: "In".to_string(),
            values: Some(architectures),
        },
        NodeSelectorRequirement {
            key: OS_LABEL.to_string(),
            operator: "In".to_string(),
            values: Some(systems),
        },
    ]
}

/// Merge required node-selector requirements into an existing affinity.
///
/// Requirements are appended to the first required term when there is one,
/// otherwise a new term is created. Everything else is kept as is.
pub fn merge_required_affinity(
    existing: Option<Affinity>,
    requirements: Vec<NodeSelectorRequirement>,
) -> Affinity {
    let mut affinity = existing.unwrap_or_default();
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
    let required = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    match required.node_selector_terms.first_mut() {
        Some(term) => term
            .match_expressions
            .get_or_insert_with(Vec::new)
            .extend(requirements),
        None => required.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: Some(requirements),
            ..Default::default()
        }),
    }

    affinity
}

/// Patch operations setting the merged affinity and the skip annotation
pub fn affinity_patch(pod: &Pod, platforms: &[Platform]) -> Vec<PatchOperation> {
    if platforms.is_empty() {
        return vec![];
    }

    let existing = pod.spec.as_ref().and_then(|s| s.affinity.clone());
    let affinity = merge_required_affinity(existing, node_selector_requirements(platforms));
    let affinity = match serde_json::to_value(&affinity) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Failed to serialize affinity, skipping");
            return vec![];
        }
    };

    let marker = platforms
        .iter()
        .map(Platform::key)
        .collect::<Vec<_>>()
        .join(",");

    let annotation = if pod.metadata.annotations.is_some() {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations", PLATFORM_AFFINITY_ANNOTATION]),
            value: serde_json::Value::String(marker),
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::Value::Object(serde_json::Map::from_iter([(
                PLATFORM_AFFINITY_ANNOTATION.to_string(),
                serde_json::Value::String(marker),
            )])),
        })
    };

    vec![
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "affinity"]),
            value: affinity,
        }),
        annotation,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImageError;
    use crate::platform::MockManifestSource;
    use k8s_openapi::api::core::v1::PodSpec;
    use std::collections::BTreeMap;

    fn linux(arch: &str) -> Platform {
        Platform::new("linux", arch)
    }

    fn keys(platforms: &[Platform]) -> Vec<String> {
        let mut keys: Vec<String> = platforms.iter().map(Platform::key).collect();
        keys.sort();
        keys
    }

    fn builder_with(
        table: Vec<(&'static str, Result<Vec<Platform>, ()>)>,
        timeout: Duration,
    ) -> AffinityBuilder {
        let mut source = MockManifestSource::new();
        source.expect_platforms().returning(move |reference| {
            let entry = table.iter().find(|(image, _)| reference.contains(image));
            match entry {
                Some((_, Ok(platforms))) => Ok(platforms.clone()),
                _ => Err(ImageError::Registry {
                    reference: reference.to_string(),
                    reason: "not found".to_string(),
                }),
            }
        });
        AffinityBuilder::with_timeout(Arc::new(PlatformResolver::new(Arc::new(source))), timeout)
    }

    #[test]
    fn intersection_keeps_shared_platforms() {
        let a = vec![linux("amd64"), linux("arm64"), linux("s390x")];
        let b = vec![linux("arm64"), linux("amd64")];
        assert_eq!(keys(&intersect_platforms(&[a, b])), vec!["linux/amd64", "linux/arm64"]);
    }

    #[test]
    fn intersection_is_order_independent() {
        let a = vec![linux("amd64"), linux("arm64"), linux("ppc64le")];
        let b = vec![linux("arm64"), linux("amd64")];
        let c = vec![linux("amd64"), linux("arm64"), linux("riscv64")];

        let forward = intersect_platforms(&[a.clone(), b.clone(), c.clone()]);
        let backward = intersect_platforms(&[c.clone(), b.clone(), a.clone()]);
        let shuffled = intersect_platforms(&[b, a, c]);

        assert_eq!(keys(&forward), keys(&backward));
        assert_eq!(keys(&forward), keys(&shuffled));
    }

    #[test]
    fn intersection_follows_first_occurrence_order() {
        let a = vec![linux("arm64"), linux("amd64"), linux("arm64")];
        let b = vec![linux("amd64"), linux("arm64")];
        let result = intersect_platforms(&[a, b]);
        assert_eq!(result, vec![linux("arm64"), linux("amd64")]);
    }

    #[test]
    fn intersection_distinguishes_variants() {
        let a = vec![linux("arm").with_variant("v7")];
        let b = vec![linux("arm").with_variant("v6")];
        assert!(intersect_platforms(&[a, b]).is_empty());
        assert!(intersect_platforms(&[]).is_empty());
    }

    #[test]
    fn requirements_cover_arch_and_os() {
        let reqs = node_selector_requirements(&[
            linux("amd64"),
            linux("arm").with_variant("v7"),
            linux("arm64"),
        ]);

        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].key, ARCH_LABEL);
        assert_eq!(
            reqs[0].values.as_deref(),
            Some(&["amd64".to_string(), "arm64".to_string()][..])
        );
        assert_eq!(reqs[1].key, OS_LABEL);
        assert_eq!(reqs[1].values.as_deref(), Some(&["linux".to_string()][..]));
    }

    #[test]
    fn merge_appends_to_first_existing_term() {
        let existing = Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![
                        NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "zone".to_string(),
                                operator: "In".to_string(),
                                values: Some(vec!["a".to_string()]),
                            }]),
                            ..Default::default()
                        },
                        NodeSelectorTerm::default(),
                    ],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged =
            merge_required_affinity(Some(existing), node_selector_requirements(&[linux("amd64")]));
        let terms = merged
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;

        assert_eq!(terms.len(), 2);
        let first = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].key, "zone");
        assert_eq!(first[1].key, ARCH_LABEL);
        assert!(terms[1].match_expressions.is_none());
    }

    #[test]
    fn merge_creates_term_when_missing() {
        let merged = merge_required_affinity(None, node_selector_requirements(&[linux("amd64")]));
        let terms = merged
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].match_expressions.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn patch_adds_affinity_and_annotation_map() {
        let pod = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        let ops = affinity_patch(&pod, &[linux("amd64")]);

        assert_eq!(ops.len(), 2);
        match &ops[0] {
            PatchOperation::Add(op) => {
                assert_eq!(op.path, PointerBuf::from_tokens(["spec", "affinity"]));
                assert!(op.value["nodeAffinity"].is_object());
            }
            other => panic!("unexpected op {other:?}"),
        }
        match &ops[1] {
            PatchOperation::Add(op) => {
                assert_eq!(op.path, PointerBuf::from_tokens(["metadata", "annotations"]));
                assert_eq!(op.value[PLATFORM_AFFINITY_ANNOTATION], "linux/amd64");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn patch_adds_single_annotation_when_map_exists() {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(BTreeMap::from([("a".to_string(), "b".to_string())]));

        let ops = affinity_patch(&pod, &[linux("amd64")]);
        match &ops[1] {
            PatchOperation::Add(op) => {
                assert_eq!(
                    op.path.to_string(),
                    "/metadata/annotations/mirage.dev~1platform-affinity"
                );
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn no_platforms_means_no_patch() {
        assert!(affinity_patch(&Pod::default(), &[]).is_empty());
    }

    #[tokio::test]
    async fn failed_images_are_excluded_from_intersection() {
        let builder = builder_with(
            vec![
                ("nginx", Ok(vec![linux("amd64"), linux("arm64")])),
                ("redis", Ok(vec![linux("arm64"), linux("amd64"), linux("s390x")])),
                ("private", Err(())),
            ],
            DEFAULT_RESOLUTION_TIMEOUT,
        );

        let images = vec![
            "nginx".to_string(),
            "private.example.com/app".to_string(),
            "redis".to_string(),
        ];
        let common = builder.common_platforms(&images).await;
        assert_eq!(keys(&common), vec!["linux/amd64", "linux/arm64"]);
    }

    #[tokio::test]
    async fn all_failures_yield_no_patch() {
        let builder = builder_with(vec![("nginx", Err(()))], DEFAULT_RESOLUTION_TIMEOUT);
        let ops = builder
            .build_patch(&Pod::default(), &["nginx".to_string()])
            .await;
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn annotated_pods_are_skipped() {
        let builder = builder_with(vec![("nginx", Ok(vec![linux("amd64")]))], DEFAULT_RESOLUTION_TIMEOUT);
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(BTreeMap::from([(
            PLATFORM_AFFINITY_ANNOTATION.to_string(),
            "linux/amd64".to_string(),
        )]));

        assert!(builder.build_patch(&pod, &["nginx".to_string()]).await.is_empty());
    }

    /// Story: a slow registry does not hold admission past the pod-wide budget
    #[tokio::test(start_paused = true)]
    async fn story_slow_lookups_are_abandoned_at_deadline() {
        struct SlowSource;

        #[async_trait::async_trait]
        impl crate::platform::ManifestSource for SlowSource {
            async fn platforms(&self, reference: &str) -> Result<Vec<Platform>, ImageError> {
                if reference.contains("slow") {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(vec![Platform::new("linux", "amd64")])
            }
        }

        let builder = AffinityBuilder::with_timeout(
            Arc::new(PlatformResolver::new(Arc::new(SlowSource))),
            Duration::from_secs(5),
        );

        let images = vec!["fast".to_string(), "slow".to_string()];
        let common = builder.common_platforms(&images).await;

        // Only the fast image counted; the slow one was dropped at the deadline.
        assert_eq!(keys(&common), vec!["linux/amd64"]);
    }
}
