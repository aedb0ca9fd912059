//! Image handling for the mirage admission webhook
//!
//! - [`reference`] - normalizes image references and applies rewrite rules
//! - [`platform`] - resolves (and caches) the platforms an image supports
//! - [`affinity`] - turns the platforms common to a pod's images into node affinity

#![deny(missing_docs)]

pub mod affinity;
pub mod error;
pub mod platform;
pub mod reference;

pub use affinity::AffinityBuilder;
pub use error::ImageError;
pub use platform::{ManifestSource, Platform, PlatformResolver, RegistryManifestSource};
pub use reference::{image_tag, is_tag_disallowed, normalize, Rewriter};
