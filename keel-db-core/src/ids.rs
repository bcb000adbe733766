//! Typed ID newtypes for cluster-wide coordination.
//!
//! Each type wraps a 128-bit UUID. The wrappers exist so a build identifier
//! can never be passed where a collection identifier is expected; the
//! compiler enforces the boundary at zero cost.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BuildId
// ---------------------------------------------------------------------------

/// Identifier naming one index-build attempt across all nodes of a cluster.
///
/// Generated on the node that initiates the build and carried in the
/// `startIndexBuild` / `commitIndexBuild` / `abortIndexBuild` log records so
/// every member coordinates on the same attempt.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BuildId(pub Uuid);

impl BuildId {
    /// Generate a fresh random build id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CollectionId
// ---------------------------------------------------------------------------

/// Identifier for a collection, stable across rename.
///
/// Coordination always prefers this over namespace strings: a rename during
/// an index build must not detach the build from its collection.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CollectionId(pub Uuid);

impl CollectionId {
    /// Generate a fresh random collection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[inline]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
