//! Errors returned by the sampler.
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for sampler operations.
pub type SamplerResult<T> = Result<T, SamplerError>;

/// Errors returned while building, configuring or shutting down samplers.
///
/// Sampling decisions themselves never fail.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SamplerError {
    /// The configuration document could not be parsed.
    #[error("invalid sampler configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("failed to read sampler configuration: {0}")]
    Io(#[from] std::io::Error),

    /// A bloom filter bitmap was not valid base64.
    #[error("invalid bloom filter bitmap: {0}")]
    Bitmap(#[from] base64::DecodeError),

    /// A bloom filter was configured with an unusable geometry.
    #[error("invalid bloom filter: {0}")]
    BloomFilter(String),

    /// The sampler was already shut down.
    #[error("sampler already shut down")]
    AlreadyShutdown,

    /// The background rotation task did not confirm shutdown.
    #[error("sampler shutdown failed: {0}")]
    ShutdownFailed(String),

    /// A sampler is already registered for the target.
    #[error("a sampler is already registered for target {0:?}")]
    TargetExists(String),

    /// No sampler is registered for the target.
    #[error("no sampler registered for target {0:?}")]
    TargetNotFound(String),

    /// Other errors not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for SamplerError {
    fn from(err: PoisonError<T>) -> Self {
        SamplerError::Other(err.to_string())
    }
}
