//! Pod admission for mirage Rules
//!
//! Every `Rule` becomes a mutation handler in the [`routing::RoutingTable`]
//! and an entry in one shared `MutatingWebhookConfiguration`. The API server
//! calls `POST /mutate-pod/{rule}`; the [`admission`] router looks the rule
//! up and rewrites, denies or constrains the pod.
//!
//! - [`routing`] - the concurrent rule-name to handler table
//! - [`handler`] - per-rule container evaluation (disallowed tags, rewrites)
//! - [`admission`] - axum router serving AdmissionReview requests
//! - [`config_sync`] - incremental patching of the shared webhook configuration
//! - [`controller`] - Rule reconciliation tying the pieces together

#![deny(missing_docs)]

pub mod admission;
pub mod config_sync;
pub mod controller;
pub mod error;
pub mod handler;
pub mod routing;

pub use admission::{webhook_router, WebhookState, WEBHOOK_PATH_PREFIX};
pub use error::WebhookError;
pub use routing::RoutingTable;
