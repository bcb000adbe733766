//! Error types for keel-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found (collection, namespace, index)
    #[error("Not found: {0}")]
    NotFound(String),

    /// An index with the requested name already exists in the catalog
    #[error("Index already exists: {0}")]
    IndexExists(String),

    /// Same index name, different options (collation, uniqueness)
    #[error("Index options conflict: {0}")]
    IndexOptionsConflict(String),

    /// Same index name, different key pattern
    #[error("Index key specs conflict: {0}")]
    IndexKeySpecsConflict(String),

    /// Spec failed validation during normalization
    #[error("Invalid index spec: {0}")]
    InvalidIndexSpec(String),

    /// Operation was killed
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Operation was killed by process shutdown
    #[error("Interrupted at shutdown: {0}")]
    InterruptedAtShutdown(String),

    /// JSON parsing error (serde_json)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an index-exists error
    pub fn index_exists(msg: impl Into<String>) -> Self {
        Error::IndexExists(msg.into())
    }

    /// Create an invalid spec error
    pub fn invalid_index_spec(msg: impl Into<String>) -> Self {
        Error::InvalidIndexSpec(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True for either interruption variant
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Error::Interrupted(_) | Error::InterruptedAtShutdown(_)
        )
    }
}
