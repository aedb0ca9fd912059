//! Mirror controller errors

/// Error type for Mirror operations
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// An error occurred while communicating with the Kubernetes API
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An error occurred during JSON serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The Mirror cannot be turned into a Job
    #[error("invalid mirror '{mirror}': {message}")]
    InvalidMirror {
        /// Name of the Mirror
        mirror: String,
        /// What is wrong with it
        message: String,
    },

    /// The registry credentials Secret is missing or of the wrong type
    #[error("spec.dockerConfig: {0}")]
    DockerConfig(String),

    /// A status event refers to an image index the Mirror does not have
    #[error("mirror '{mirror}' has no image at completion index {index}")]
    IndexOutOfRange {
        /// Name of the Mirror
        mirror: String,
        /// Completion index from the pod
        index: usize,
    },
}

impl MirrorError {
    /// Whether a status write lost a race with another writer.
    ///
    /// Covers optimistic-concurrency conflicts (409) and failed JSON patch
    /// `test` guards (422).
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 422)
    }

    /// Build an invalid-mirror error
    pub fn invalid(mirror: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidMirror {
            mirror: mirror.into(),
            message: message.into(),
        }
    }
}
