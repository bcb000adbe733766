//! Scoped blockers: RAII reservations that deny new index-build
//! registrations on a target while a caller drains the existing builds.
//!
//! Drop-collection and drop-database take one of these first, then abort the
//! active builds and wait for the trackers to drain; in the meantime no new
//! build can register on the target:
//!
//! ```ignore
//! let _stop = ScopedStopNewCollectionIndexBuilds::new(&coordinator, collection_id);
//! coordinator.abort_collection_index_builds(collection_id, "collection dropped").await;
//! // ...drop the collection...
//! ```
//!
//! The counters are reentrant: concurrent drop operations stack, and builds
//! are allowed again only when the last holder releases.

use crate::coordinator::IndexBuildsCoordinator;
use crate::registry::BuildRegistry;
use keel_db_core::CollectionId;
use std::sync::Arc;

/// Blocks new index builds on a database for this object's lifetime.
#[derive(Debug)]
pub struct ScopedStopNewDatabaseIndexBuilds {
    registry: Arc<BuildRegistry>,
    db_name: String,
}

impl ScopedStopNewDatabaseIndexBuilds {
    pub fn new(coordinator: &IndexBuildsCoordinator, db_name: impl Into<String>) -> Self {
        let registry = coordinator.registry().clone();
        let db_name = db_name.into();
        registry.disallow_builds_on_db(&db_name);
        Self { registry, db_name }
    }
}

impl Drop for ScopedStopNewDatabaseIndexBuilds {
    fn drop(&mut self) {
        self.registry.allow_builds_on_db(&self.db_name);
    }
}

/// Blocks new index builds on a collection for this object's lifetime.
#[derive(Debug)]
pub struct ScopedStopNewCollectionIndexBuilds {
    registry: Arc<BuildRegistry>,
    collection_id: CollectionId,
}

impl ScopedStopNewCollectionIndexBuilds {
    pub fn new(coordinator: &IndexBuildsCoordinator, collection_id: CollectionId) -> Self {
        let registry = coordinator.registry().clone();
        registry.disallow_builds_on_collection(collection_id);
        Self {
            registry,
            collection_id,
        }
    }
}

impl Drop for ScopedStopNewCollectionIndexBuilds {
    fn drop(&mut self) {
        self.registry.allow_builds_on_collection(self.collection_id);
    }
}
