//! Error types for the index builds coordinator.
//!
//! `BuildError` is `Clone`: one terminal outcome is broadcast through the
//! build's promise to every joiner, so the error must be shareable.

use keel_db_core::BuildId;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, BuildError>;

/// Coordinator error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Registration denied (scoped blocker active) or spec rejected
    #[error("Cannot create index: {0}")]
    CannotCreateIndex(String),

    /// Another build on the collection is constructing an index of this name
    #[error("Index build already in progress: {0}")]
    IndexBuildAlreadyInProgress(String),

    /// The build (or the colliding build) was aborted
    #[error("Index build aborted: {0}")]
    IndexBuildAborted(String),

    /// Collection or database does not exist
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Uniqueness constraint violated during the final drain
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The requested index already exists in the catalog
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// Same index name, different options
    #[error("Index options conflict: {0}")]
    IndexOptionsConflict(String),

    /// Same index name, different key pattern
    #[error("Index key specs conflict: {0}")]
    IndexKeySpecsConflict(String),

    /// No in-progress index matching the request
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Operation context was killed
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Operation context was killed by process shutdown
    #[error("Interrupted at shutdown: {0}")]
    InterruptedAtShutdown(String),

    /// DDL blocked: builds are running on the database
    #[error("Background operation in progress for database: {0}")]
    BackgroundOperationInProgressForDatabase(String),

    /// DDL blocked: builds are running on the collection
    #[error("Background operation in progress for namespace: {0}")]
    BackgroundOperationInProgressForNamespace(String),

    /// No registered build with this id
    #[error("No index build with id: {0}")]
    NoSuchBuild(BuildId),

    /// The requested commit quorum cannot be satisfied
    #[error("Unsatisfiable commit quorum: {0}")]
    UnsatisfiableCommitQuorum(String),

    /// Deliberately disabled path; the precondition documents why
    #[error("Not yet implemented: {0}")]
    NotYetImplemented(String),

    /// Catalog-level failure, carried as text
    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl BuildError {
    /// True for either interruption variant
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            BuildError::Interrupted(_) | BuildError::InterruptedAtShutdown(_)
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, BuildError::InterruptedAtShutdown(_))
    }
}

impl From<keel_db_core::Error> for BuildError {
    fn from(err: keel_db_core::Error) -> Self {
        use keel_db_core::Error as Core;
        match err {
            Core::IndexExists(msg) => BuildError::IndexAlreadyExists(msg),
            Core::IndexOptionsConflict(msg) => BuildError::IndexOptionsConflict(msg),
            Core::IndexKeySpecsConflict(msg) => BuildError::IndexKeySpecsConflict(msg),
            Core::InvalidIndexSpec(msg) => BuildError::CannotCreateIndex(msg),
            Core::Interrupted(msg) => BuildError::Interrupted(msg),
            Core::InterruptedAtShutdown(msg) => BuildError::InterruptedAtShutdown(msg),
            other => BuildError::Catalog(other.to_string()),
        }
    }
}

/// Log and halt. Used where continuing would leave the catalog inconsistent
/// (recovery failures) or diverge this node from the primary (a local failure
/// followed by a replicated commit signal).
pub(crate) fn fatal_invariant(context: &str, err: &BuildError) -> ! {
    tracing::error!(error = %err, "{context}");
    panic!("{context}: {err}");
}
