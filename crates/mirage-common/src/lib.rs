//! Common types for the mirage image operator
//!
//! Holds everything the operator crates share:
//! - [`crd`] - `Rule` and `Mirror` custom resources plus status conditions
//! - [`retry`] - exponential backoff, including the optimistic-concurrency variant
//! - [`kube_utils`] - small helpers around kube-rs API errors and status patches

#![deny(missing_docs)]

pub mod crd;
pub mod kube_utils;
pub mod retry;

// =============================================================================
// Shared constants
// =============================================================================

/// `apiVersion` string used in owner references
pub const API_GROUP_VERSION: &str = "mirage.dev/v1";

/// Name of the operator, used for the shared webhook configuration and labels
pub const OPERATOR_NAME: &str = "mirage-operator";

/// Field manager for all writes performed by the operator
pub const FIELD_MANAGER: &str = "mirage-operator";

/// Standard label marking objects managed by the operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Annotation placed on mirror pods pointing back at their Mirror
pub const MIRROR_ANNOTATION: &str = "mirage.dev/mirror";

/// Label Kubernetes sets on pods of indexed Jobs
pub const COMPLETION_INDEX_LABEL: &str = "batch.kubernetes.io/job-completion-index";

/// Annotation marking a pod whose node affinity was already derived from image platforms
pub const PLATFORM_AFFINITY_ANNOTATION: &str = "mirage.dev/platform-affinity";
