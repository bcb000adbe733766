//! Per-collection and per-database aggregates of in-flight builds.
//!
//! Trackers live inside the registry's single mutex; none of their methods
//! take locks of their own. What outlives the mutex is the count channel:
//! a caller that must wait for a tracker to drain subscribes under the
//! registry lock and waits outside it. The tracker may be erased while the
//! waiter sleeps; the closed channel then reads as "no builds remain", so the
//! wait is race-free without keeping the tracker alive in the registry.

use crate::build_state::IndexBuildState;
use keel_db_core::BuildId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Builds running on one collection, indexed by build id and by index name.
#[derive(Debug)]
pub(crate) struct CollectionBuildsTracker {
    by_build: HashMap<BuildId, Arc<IndexBuildState>>,
    by_index_name: HashMap<String, Arc<IndexBuildState>>,
    count_tx: watch::Sender<usize>,
}

impl CollectionBuildsTracker {
    pub(crate) fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            by_build: HashMap::new(),
            by_index_name: HashMap::new(),
            count_tx,
        }
    }

    /// Caller must have verified the name-conflict rule first.
    pub(crate) fn add(&mut self, record: Arc<IndexBuildState>) {
        for name in &record.index_names {
            let previous = self.by_index_name.insert(name.clone(), record.clone());
            debug_assert!(previous.is_none(), "index name registered twice: {name}");
        }
        self.by_build.insert(record.build_id, record);
        self.count_tx.send_replace(self.by_build.len());
    }

    pub(crate) fn remove(&mut self, record: &IndexBuildState) {
        for name in &record.index_names {
            self.by_index_name.remove(name);
        }
        self.by_build.remove(&record.build_id);
        self.count_tx.send_replace(self.by_build.len());
    }

    pub(crate) fn build_for_index_name(&self, name: &str) -> Option<&Arc<IndexBuildState>> {
        self.by_index_name.get(name)
    }

    pub(crate) fn builds(&self) -> impl Iterator<Item = &Arc<IndexBuildState>> {
        self.by_build.values()
    }

    pub(crate) fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_index_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn num_builds(&self) -> usize {
        self.by_build.len()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

/// Builds running on one database.
#[derive(Debug)]
pub(crate) struct DatabaseBuildsTracker {
    builds: HashMap<BuildId, Arc<IndexBuildState>>,
    count_tx: watch::Sender<usize>,
}

impl DatabaseBuildsTracker {
    pub(crate) fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            builds: HashMap::new(),
            count_tx,
        }
    }

    pub(crate) fn add(&mut self, record: Arc<IndexBuildState>) {
        self.builds.insert(record.build_id, record);
        self.count_tx.send_replace(self.builds.len());
    }

    pub(crate) fn remove(&mut self, build_id: BuildId) {
        self.builds.remove(&build_id);
        self.count_tx.send_replace(self.builds.len());
    }

    pub(crate) fn builds(&self) -> impl Iterator<Item = &Arc<IndexBuildState>> {
        self.builds.values()
    }

    pub(crate) fn num_builds(&self) -> usize {
        self.builds.len()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }
}

/// Wait until a tracker count channel reads zero. A closed channel means the
/// tracker was erased, which is the same thing.
pub(crate) async fn await_quiesced(mut rx: watch::Receiver<usize>) {
    let _ = rx.wait_for(|count| *count == 0).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_state::IndexBuildProtocol;
    use keel_db_core::{CollectionId, IndexSpec};

    fn record(names: &[&str]) -> Arc<IndexBuildState> {
        IndexBuildState::new(
            BuildId::new(),
            CollectionId::new(),
            "app",
            names.iter().map(|n| IndexSpec::ascending(*n, &["f"])).collect(),
            IndexBuildProtocol::SinglePhase,
            None,
        )
    }

    #[test]
    fn collection_tracker_indexes_by_name_and_build() {
        let mut tracker = CollectionBuildsTracker::new();
        let a = record(&["idx_a", "idx_b"]);
        let b = record(&["idx_c"]);
        tracker.add(a.clone());
        tracker.add(b.clone());

        assert_eq!(tracker.num_builds(), 2);
        assert_eq!(
            tracker.build_for_index_name("idx_b").unwrap().build_id,
            a.build_id
        );
        assert_eq!(tracker.index_names(), vec!["idx_a", "idx_b", "idx_c"]);

        tracker.remove(&a);
        assert_eq!(tracker.num_builds(), 1);
        assert!(tracker.build_for_index_name("idx_a").is_none());
    }

    #[tokio::test]
    async fn quiesce_wait_survives_tracker_erasure() {
        let mut tracker = DatabaseBuildsTracker::new();
        let r = record(&["idx"]);
        tracker.add(r.clone());
        let rx = tracker.subscribe();

        let waiter = tokio::spawn(await_quiesced(rx));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // Dropping the tracker entirely (erasure from the registry) closes
        // the channel and releases the waiter.
        drop(tracker);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn quiesce_wait_releases_at_zero() {
        let mut tracker = DatabaseBuildsTracker::new();
        let r = record(&["idx"]);
        tracker.add(r.clone());
        let rx = tracker.subscribe();

        let waiter = tokio::spawn(await_quiesced(rx));
        tracker.remove(r.build_id);
        waiter.await.unwrap();
        assert_eq!(tracker.num_builds(), 0);
    }
}
