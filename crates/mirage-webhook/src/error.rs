//! Webhook and Rule controller errors

use kube::runtime::finalizer;

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// An error occurred while communicating with the Kubernetes API
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The Rule failed validation
    #[error("invalid rule '{rule}': {message}")]
    InvalidRule {
        /// Name of the Rule
        rule: String,
        /// Validation message
        message: String,
    },

    /// Adding or removing the Rule finalizer failed
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<WebhookError>>),
}

impl WebhookError {
    /// Whether the error came from a write based on a stale read.
    ///
    /// Covers optimistic-concurrency conflicts (409) and failed JSON patch
    /// `test` guards, which the API server reports as 422.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 422)
    }
}
