//! Image reference normalization and rewriting
//!
//! Normalization follows the usual container-registry resolution rules:
//! a bare name lives under `docker.io/library`, a single-segment path lives
//! on `docker.io` unless its first segment looks like a host, and a missing
//! tag means `latest`.

use mirage_common::crd::RewriteRule;
use regex::Regex;
use tracing::warn;

/// Registry assumed when a reference names none
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference carries none
pub const DEFAULT_TAG: &str = "latest";

/// Whether the last path segment carries a tag or the reference a digest
fn has_tag_or_digest(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment.contains(':')
}

/// Whether the first path segment names a registry host
fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Normalize an image reference to `registry/repository:tag`.
///
/// ```text
/// busybox             -> docker.io/library/busybox:latest
/// docker.io/busybox   -> docker.io/library/busybox:latest
/// foo/busybox         -> docker.io/foo/busybox:latest
/// gcr.io/busybox:1.0  -> gcr.io/busybox:1.0
/// ```
///
/// Normalizing an already normalized reference returns it unchanged.
pub fn normalize(image: &str) -> String {
    let mut image = image.trim().to_string();
    if !has_tag_or_digest(&image) {
        image.push(':');
        image.push_str(DEFAULT_TAG);
    }

    match image.matches('/').count() {
        0 => format!("{DEFAULT_REGISTRY}/library/{image}"),
        1 => {
            let (first, rest) = image.split_once('/').unwrap_or((image.as_str(), ""));
            if first == DEFAULT_REGISTRY {
                format!("{DEFAULT_REGISTRY}/library/{rest}")
            } else if looks_like_host(first) {
                image
            } else {
                format!("{DEFAULT_REGISTRY}/{image}")
            }
        }
        _ => image,
    }
}

/// Tag of a raw (not normalized) image reference, without the leading colon.
///
/// Returns `latest` when the reference has no tag. Registry ports and digests
/// are not mistaken for tags.
pub fn image_tag(image: &str) -> &str {
    let without_digest = image.split_once('@').map_or(image, |(name, _)| name);
    let last_segment = without_digest
        .rsplit('/')
        .next()
        .unwrap_or(without_digest);

    match last_segment.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag,
        _ => DEFAULT_TAG,
    }
}

/// Whether the image's tag is one of `disallowed`.
///
/// Entries are compared with any leading colon trimmed, so `latest` and
/// `:latest` are equivalent.
pub fn is_tag_disallowed(image: &str, disallowed: &[String]) -> bool {
    let tag = image_tag(image);
    disallowed
        .iter()
        .any(|candidate| candidate.trim_start_matches(':') == tag)
}

struct CompiledRule {
    registry: Option<String>,
    pattern: Option<Regex>,
    replacement: String,
}

/// Ordered rewrite rules with their regular expressions compiled once.
///
/// Rules are tried in declaration order and the first match wins. Within a
/// rule the registry prefix is tried before the regex. A regex that fails to
/// compile is logged and its rule only matches by registry, if any.
pub struct Rewriter {
    rules: Vec<CompiledRule>,
}

impl Rewriter {
    /// Compile the given rules
    pub fn new(rules: &[RewriteRule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| {
                let registry = rule.registry.clone().filter(|r| !r.is_empty());
                let pattern = rule
                    .regex
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .and_then(|r| match Regex::new(r) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(regex = %r, error = %e, "Skipping rewrite rule with invalid regex");
                            None
                        }
                    });
                CompiledRule {
                    registry,
                    pattern,
                    replacement: rule.replacement.clone(),
                }
            })
            .collect();

        Self { rules }
    }

    /// Whether there is nothing to rewrite with
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite `image`, returning the new reference if any rule matched.
    ///
    /// The image is normalized before matching, so the result is always a
    /// fully qualified reference.
    pub fn rewrite(&self, image: &str) -> Option<String> {
        let image = normalize(image);

        for rule in &self.rules {
            if let Some(registry) = &rule.registry {
                if image.starts_with(&format!("{registry}/")) {
                    return Some(image.replacen(registry.as_str(), &rule.replacement, 1));
                }
            }

            if let Some(pattern) = &rule.pattern {
                if pattern.is_match(&image) {
                    return Some(
                        pattern
                            .replace_all(&image, rule.replacement.as_str())
                            .into_owned(),
                    );
                }
            }
        }

        None
    }
}
