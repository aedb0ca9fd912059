//! Image resolution errors

/// Errors raised while resolving an image's platforms
///
/// Callers never fail an admission request on these; a failed lookup only
/// means no platform constraint can be derived from that image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The image string is not a valid registry reference
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference {
        /// The offending reference
        reference: String,
        /// Parser message
        reason: String,
    },

    /// Fetching the manifest or config from the registry failed
    #[error("registry request for '{reference}' failed: {reason}")]
    Registry {
        /// The image being resolved
        reference: String,
        /// Client error message
        reason: String,
    },

    /// The image config blob could not be decoded
    #[error("failed to decode image config for '{reference}': {source}")]
    Config {
        /// The image being resolved
        reference: String,
        /// Decode error
        source: serde_json::Error,
    },
}
