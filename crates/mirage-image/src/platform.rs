//! Image platform resolution
//!
//! Looks up which OS/architecture combinations an image supports by reading
//! its manifest from the registry. Multi-platform indexes yield one platform
//! per child manifest; single-platform images yield the platform of their
//! config. Results are kept in a bounded LRU cache keyed by the raw image
//! string, since every lookup is a registry round trip.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciManifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::ImageError;
use crate::reference::normalize;

/// Number of images whose platforms are cached
pub const PLATFORM_CACHE_CAPACITY: usize = 100;

/// OS value registries use for attestation manifests inside an index
const UNKNOWN_OS: &str = "unknown";

/// An (OS, architecture, variant) triple an image supports
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system, e.g. `linux`
    pub os: String,
    /// CPU architecture, e.g. `amd64`
    pub architecture: String,
    /// Architecture variant, e.g. `v7`
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform without a variant
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    /// Set the architecture variant
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into()).filter(|v: &String| !v.is_empty());
        self
    }

    /// Canonical identity used for set operations, `os/arch[/variant]`
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Value of the `kubernetes.io/arch` node label this platform runs on.
    ///
    /// `arm/v7` is scheduled as `arm64`.
    pub fn node_architecture(&self) -> &str {
        match (self.architecture.as_str(), self.variant.as_deref()) {
            ("arm", Some("v7")) => "arm64",
            (arch, _) => arch,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl From<oci_distribution::manifest::Platform> for Platform {
    fn from(p: oci_distribution::manifest::Platform) -> Self {
        let platform = Self::new(p.os, p.architecture);
        match p.variant {
            Some(variant) => platform.with_variant(variant),
            None => platform,
        }
    }
}

/// Platform fields of an image config blob
#[derive(Debug, Deserialize)]
struct ImageConfigPlatform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

/// Source of image platform information
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Platforms supported by a normalized image reference
    async fn platforms(&self, reference: &str) -> Result<Vec<Platform>, ImageError>;
}

/// [`ManifestSource`] backed by an OCI registry client with anonymous auth
pub struct RegistryManifestSource {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryManifestSource {
    /// Create a source talking HTTPS to registries
    pub fn new() -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }
}

impl Default for RegistryManifestSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestSource for RegistryManifestSource {
    async fn platforms(&self, reference: &str) -> Result<Vec<Platform>, ImageError> {
        let parsed = reference.parse::<Reference>().map_err(|e| {
            ImageError::InvalidReference {
                reference: reference.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (manifest, _digest) = self
            .client
            .pull_manifest(&parsed, &self.auth)
            .await
            .map_err(registry_error(reference))?;

        match manifest {
            OciManifest::ImageIndex(index) => Ok(index
                .manifests
                .into_iter()
                .filter_map(|m| m.platform)
                .filter(|p| !p.os.is_empty() && p.os != UNKNOWN_OS)
                .map(Platform::from)
                .collect()),
            OciManifest::Image(_) => {
                let (_manifest, _digest, config) = self
                    .client
                    .pull_manifest_and_config(&parsed, &self.auth)
                    .await
                    .map_err(registry_error(reference))?;
                let config: ImageConfigPlatform =
                    serde_json::from_str(&config).map_err(|source| ImageError::Config {
                        reference: reference.to_string(),
                        source,
                    })?;

                let platform = Platform::new(config.os, config.architecture);
                Ok(vec![match config.variant {
                    Some(variant) => platform.with_variant(variant),
                    None => platform,
                }])
            }
        }
    }
}

fn registry_error<E: std::fmt::Display>(reference: &str) -> impl Fn(E) -> ImageError + '_ {
    move |e| ImageError::Registry {
        reference: reference.to_string(),
        reason: e.to_string(),
    }
}

/// Resolves image platforms through a [`ManifestSource`] with an LRU cache
pub struct PlatformResolver {
    source: Arc<dyn ManifestSource>,
    cache: Mutex<LruCache<String, Vec<Platform>>>,
}

impl PlatformResolver {
    /// Create a resolver with the default cache capacity
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self::with_capacity(source, PLATFORM_CACHE_CAPACITY)
    }

    /// Create a resolver caching at most `capacity` images
    pub fn with_capacity(source: Arc<dyn ManifestSource>, capacity: usize) -> Self {
        Self {
            source,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Platforms supported by `image`, memoized by the raw image string.
    ///
    /// Failures are not cached.
    pub async fn resolve(&self, image: &str) -> Result<Vec<Platform>, ImageError> {
        let cached = self.cache.lock().get(image).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let started = Instant::now();
        let platforms = self.source.platforms(&normalize(image)).await?;

        debug!(
            image = %image,
            platforms = ?platforms.iter().map(Platform::key).collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Resolved image platforms"
        );

        self.cache.lock().put(image.to_string(), platforms.clone());
        Ok(platforms)
    }

    /// Number of cached images
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
