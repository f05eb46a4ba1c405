use std::sync::Arc;

use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Archive header or one of its sections is malformed, or a layer
    /// stream could not be parsed while indexing
    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    /// Digest is not part of the archive's registry coordinates, or the
    /// origin has no blob under that digest
    #[error("Layer not found: {digest}")]
    LayerNotFound { digest: String },

    /// A checkpoint did not line up with the compressed stream
    #[error("Checkpoint inconsistent for {digest} at compressed offset {compressed_offset}: {message}")]
    CheckpointInconsistent {
        digest: String,
        compressed_offset: u64,
        message: String,
    },

    /// Writing a disk cache entry failed
    #[error("Cache write failed for {digest}: {message}")]
    CacheWriteFailed { digest: String, message: String },

    /// Registry rejected the request even after authentication
    #[error("Registry unauthorized: {registry} - {message}")]
    RegistryUnauthorized { registry: String, message: String },

    /// Registry could not be reached or answered with a server error
    #[error("Registry unreachable: {registry} - {message}")]
    RegistryUnreachable { registry: String, message: String },

    /// A whiteout entry could not be applied
    #[error("Whiteout violation at {path}: {message}")]
    WhiteoutViolation { path: String, message: String },

    /// Path is not present in the index
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Origin blob failed verification or decompression
    #[error("Corrupt layer {digest}: {message}")]
    CorruptLayer { digest: String, message: String },

    /// Image reference could not be parsed or resolved
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Layer media type is not supported (only gzip tar layers are)
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outcome of a deduplicated operation, shared by every waiter
    #[error("{0}")]
    Shared(Arc<StrataError>),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// True when the requested content genuinely does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::PathNotFound(_) | Self::LayerNotFound { .. } => true,
            Self::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// True for origin or cache failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RegistryUnreachable { .. } | Self::CacheWriteFailed { .. } => true,
            Self::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
