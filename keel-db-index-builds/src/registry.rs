//! The build registry: every map the coordinator keeps, under one mutex.
//!
//! Three mappings (build id, collection, database) plus the two blocker
//! counters used by the scoped stop guards. Every operation here is pure
//! bookkeeping; everything slow happens outside the mutex. Do not shard the
//! lock. Nothing in this module awaits while holding it, and nothing takes a
//! lock-manager lock or a per-record wait while holding it; that ordering
//! keeps the signal paths deadlock-free.

use crate::build_state::IndexBuildState;
use crate::error::{BuildError, Result};
use crate::tracker::{await_quiesced, CollectionBuildsTracker, DatabaseBuildsTracker};
use keel_db_core::{BuildId, CollectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Default)]
struct RegistryInner {
    all_builds: HashMap<BuildId, Arc<IndexBuildState>>,
    collection_builds: HashMap<CollectionId, CollectionBuildsTracker>,
    database_builds: HashMap<String, DatabaseBuildsTracker>,
    // Nonzero entries deny registration on the target. Counters, not
    // booleans: concurrent drop operations stack.
    disallowed_collections: HashMap<CollectionId, u32>,
    disallowed_dbs: HashMap<String, u32>,
}

/// Registry of in-flight index builds.
#[derive(Debug, Default)]
pub struct BuildRegistry {
    inner: Mutex<RegistryInner>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a build so the rest of the system can discover it.
    ///
    /// The blocker check and the name-conflict check are atomic with the
    /// insertion: no window exists in which a colliding or blocked build can
    /// slip in.
    pub fn register(&self, record: Arc<IndexBuildState>) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.disallowed_collections.contains_key(&record.collection_id)
            || inner.disallowed_dbs.contains_key(&record.db_name)
        {
            return Err(BuildError::CannotCreateIndex(format!(
                "collection {} is being dropped; new index builds are not allowed",
                record.collection_id
            )));
        }

        if let Some(tracker) = inner.collection_builds.get(&record.collection_id) {
            for name in &record.index_names {
                if let Some(existing) = tracker.build_for_index_name(name) {
                    let signal = existing.signal_snapshot();
                    let mut msg = format!(
                        "index build conflict: {}: an index named '{}' is already being built \
                         on collection {} by build {}",
                        record.build_id, name, record.collection_id, existing.build_id
                    );
                    let aborted = signal.aborted;
                    if signal.commit_ready {
                        msg.push_str(&format!(
                            " (ready to commit with timestamp {})",
                            signal.commit_timestamp
                        ));
                    } else if signal.aborted {
                        msg.push_str(&format!(
                            " (aborted with reason '{}' and timestamp {})",
                            signal.abort_reason.as_deref().unwrap_or(""),
                            signal.abort_timestamp
                        ));
                    } else {
                        msg.push_str(" (in progress)");
                    }
                    info!(build_id = %record.build_id, "{msg}");
                    return Err(if aborted {
                        BuildError::IndexBuildAborted(msg)
                    } else {
                        BuildError::IndexBuildAlreadyInProgress(msg)
                    });
                }
            }
        }

        inner
            .database_builds
            .entry(record.db_name.clone())
            .or_insert_with(DatabaseBuildsTracker::new)
            .add(record.clone());
        inner
            .collection_builds
            .entry(record.collection_id)
            .or_insert_with(CollectionBuildsTracker::new)
            .add(record.clone());
        let previous = inner.all_builds.insert(record.build_id, record);
        debug_assert!(previous.is_none(), "build id registered twice");
        Ok(())
    }

    /// Remove a build from all three mappings, erasing trackers that drain
    /// to empty (and waking their quiesce waiters through the closed or
    /// zeroed count channel).
    pub fn unregister(&self, record: &IndexBuildState) {
        let mut inner = self.inner.lock();

        if let Some(tracker) = inner.database_builds.get_mut(&record.db_name) {
            tracker.remove(record.build_id);
            if tracker.num_builds() == 0 {
                inner.database_builds.remove(&record.db_name);
            }
        }
        if let Some(tracker) = inner.collection_builds.get_mut(&record.collection_id) {
            tracker.remove(record);
            if tracker.num_builds() == 0 {
                inner.collection_builds.remove(&record.collection_id);
            }
        }
        let removed = inner.all_builds.remove(&record.build_id);
        debug_assert!(removed.is_some(), "unregistering an unknown build");
    }

    // -- lookups ------------------------------------------------------------

    pub fn get(&self, build_id: BuildId) -> Result<Arc<IndexBuildState>> {
        self.inner
            .lock()
            .all_builds
            .get(&build_id)
            .cloned()
            .ok_or(BuildError::NoSuchBuild(build_id))
    }

    /// Snapshot of every active build. Records are reference-counted, so the
    /// caller may examine them without re-locking.
    pub fn active_builds(&self) -> Vec<Arc<IndexBuildState>> {
        self.inner.lock().all_builds.values().cloned().collect()
    }

    pub fn builds_for_collection(&self, id: CollectionId) -> Vec<Arc<IndexBuildState>> {
        self.inner
            .lock()
            .collection_builds
            .get(&id)
            .map(|t| t.builds().cloned().collect())
            .unwrap_or_default()
    }

    pub fn builds_for_db(&self, db: &str) -> Vec<Arc<IndexBuildState>> {
        self.inner
            .lock()
            .database_builds
            .get(db)
            .map(|t| t.builds().cloned().collect())
            .unwrap_or_default()
    }

    pub fn in_prog_for_collection(&self, id: CollectionId) -> bool {
        self.inner.lock().collection_builds.contains_key(&id)
    }

    pub fn in_prog_for_db(&self, db: &str) -> bool {
        self.inner.lock().database_builds.contains_key(db)
    }

    pub fn num_in_prog_for_db(&self, db: &str) -> usize {
        self.inner
            .lock()
            .database_builds
            .get(db)
            .map(|t| t.num_builds())
            .unwrap_or(0)
    }

    pub fn num_active(&self) -> usize {
        self.inner.lock().all_builds.len()
    }

    // -- quiesce waits ------------------------------------------------------

    /// Wait until no builds remain on the collection.
    pub async fn await_no_builds_for_collection(&self, id: CollectionId) {
        let Some(rx) = self.subscribe_collection(id) else {
            return;
        };
        await_quiesced(rx).await;
    }

    /// Wait until no builds remain on the database.
    pub async fn await_no_builds_for_db(&self, db: &str) {
        let Some(rx) = self.subscribe_db(db) else {
            return;
        };
        await_quiesced(rx).await;
    }

    pub(crate) fn subscribe_collection(&self, id: CollectionId) -> Option<watch::Receiver<usize>> {
        self.inner
            .lock()
            .collection_builds
            .get(&id)
            .map(|t| t.subscribe())
    }

    pub(crate) fn subscribe_db(&self, db: &str) -> Option<watch::Receiver<usize>> {
        self.inner.lock().database_builds.get(db).map(|t| t.subscribe())
    }

    pub(crate) fn tracked_db_names(&self) -> Vec<String> {
        self.inner.lock().database_builds.keys().cloned().collect()
    }

    // -- scoped blocker counters --------------------------------------------

    pub(crate) fn disallow_builds_on_collection(&self, id: CollectionId) {
        *self
            .inner
            .lock()
            .disallowed_collections
            .entry(id)
            .or_insert(0) += 1;
    }

    pub(crate) fn allow_builds_on_collection(&self, id: CollectionId) {
        let mut inner = self.inner.lock();
        let count = inner
            .disallowed_collections
            .get_mut(&id)
            .expect("allowing builds on a collection that was never disallowed");
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            inner.disallowed_collections.remove(&id);
        }
    }

    pub(crate) fn disallow_builds_on_db(&self, db: &str) {
        *self
            .inner
            .lock()
            .disallowed_dbs
            .entry(db.to_owned())
            .or_insert(0) += 1;
    }

    pub(crate) fn allow_builds_on_db(&self, db: &str) {
        let mut inner = self.inner.lock();
        let count = inner
            .disallowed_dbs
            .get_mut(db)
            .expect("allowing builds on a database that was never disallowed");
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            inner.disallowed_dbs.remove(db);
        }
    }

    pub fn is_collection_disallowed(&self, id: CollectionId) -> bool {
        self.inner.lock().disallowed_collections.contains_key(&id)
    }

    pub fn is_db_disallowed(&self, db: &str) -> bool {
        self.inner.lock().disallowed_dbs.contains_key(db)
    }

    // -- diagnostics --------------------------------------------------------

    /// Collections with builds and the index names building on each.
    pub fn collection_summaries(&self) -> Vec<(CollectionId, Vec<String>)> {
        self.inner
            .lock()
            .collection_builds
            .iter()
            .map(|(id, tracker)| (*id, tracker.index_names()))
            .collect()
    }

    /// Per-database build counts.
    pub fn database_counts(&self) -> Vec<(String, usize)> {
        self.inner
            .lock()
            .database_builds
            .iter()
            .map(|(db, tracker)| (db.clone(), tracker.num_builds()))
            .collect()
    }

    /// All mappings and both blocker counters must be empty at coordinator
    /// teardown.
    pub fn verify_quiescent(&self) -> std::result::Result<(), String> {
        let inner = self.inner.lock();
        if !inner.all_builds.is_empty() {
            return Err(format!("{} builds still registered", inner.all_builds.len()));
        }
        if !inner.collection_builds.is_empty() {
            return Err("collection trackers remain".into());
        }
        if !inner.database_builds.is_empty() {
            return Err("database trackers remain".into());
        }
        if !inner.disallowed_collections.is_empty() || !inner.disallowed_dbs.is_empty() {
            return Err("scoped blockers remain".into());
        }
        Ok(())
    }
}
