//! Image mirroring for mirage
//!
//! A `Mirror` is expanded into one indexed Job; completion index `i` copies
//! the `i`-th expanded image. Job and Pod events flow back into the Mirror's
//! status, keyed by that same index.
//!
//! - [`job`] - image expansion, transfer scripts and the Job itself
//! - [`status`] - folding Job and Pod state into `MirrorStatus`
//! - [`controller`] - watch loop creating Jobs and routing status events
//! - [`cleanup`] - periodic removal of finished Mirrors

#![deny(missing_docs)]

pub mod cleanup;
pub mod controller;
pub mod error;
pub mod job;
pub mod status;

pub use controller::{MirrorContext, MirrorRequest};
pub use error::MirrorError;
pub use job::{build_mirror_job, expand_images, ExpandedImage};
