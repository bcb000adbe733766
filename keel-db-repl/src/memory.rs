//! In-memory replication collaborators for tests and embedded deployments.

use crate::op_observer::OpObserver;
use crate::oplog::{IndexBuildOplogEntry, OplogEntryKind};
use crate::{ReplSettings, ReplicationCoordinator};
use keel_db_core::Namespace;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Switchable node role: standalone, replica-set primary, or secondary.
///
/// `set_primary(false)` on a repl-set node models a step-down; tests flip it
/// while builds are in flight to exercise the signal paths.
#[derive(Debug)]
pub struct MemoryReplCoordinator {
    using_repl_sets: bool,
    primary: AtomicBool,
}

impl MemoryReplCoordinator {
    /// A standalone node: no replica set, always accepts writes.
    pub fn standalone() -> Self {
        Self {
            using_repl_sets: false,
            primary: AtomicBool::new(true),
        }
    }

    /// A replica-set member, initially primary or secondary.
    pub fn repl_set_member(primary: bool) -> Self {
        Self {
            using_repl_sets: true,
            primary: AtomicBool::new(primary),
        }
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }
}

impl ReplicationCoordinator for MemoryReplCoordinator {
    fn settings(&self) -> ReplSettings {
        ReplSettings {
            using_repl_sets: self.using_repl_sets,
        }
    }

    fn can_accept_writes_for(&self, _namespace: &Namespace) -> bool {
        if !self.using_repl_sets {
            return true;
        }
        self.primary.load(Ordering::SeqCst)
    }
}

/// Observer that appends every record to an in-memory log.
#[derive(Debug, Default)]
pub struct MemoryOpObserver {
    entries: Mutex<Vec<IndexBuildOplogEntry>>,
}

impl MemoryOpObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries, in write order.
    pub fn entries(&self) -> Vec<IndexBuildOplogEntry> {
        self.entries.lock().clone()
    }

    /// Entries of one kind, in write order.
    pub fn entries_of_kind(&self, kind: OplogEntryKind) -> Vec<IndexBuildOplogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    fn record(&self, entry: IndexBuildOplogEntry) {
        debug!(
            kind = ?entry.kind,
            build_id = %entry.build_id,
            namespace = %entry.namespace,
            "recording index build oplog entry"
        );
        self.entries.lock().push(entry);
    }
}

impl OpObserver for MemoryOpObserver {
    fn on_start_index_build(&self, entry: IndexBuildOplogEntry) {
        self.record(entry);
    }

    fn on_commit_index_build(&self, entry: IndexBuildOplogEntry) {
        self.record(entry);
    }

    fn on_abort_index_build(&self, entry: IndexBuildOplogEntry) {
        self.record(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_db_core::{BuildId, CollectionId, IndexSpec, Timestamp};

    #[test]
    fn standalone_always_accepts_writes() {
        let repl = MemoryReplCoordinator::standalone();
        let ns = Namespace::new("app", "events");
        assert!(!repl.settings().using_repl_sets);
        assert!(repl.can_accept_writes_for(&ns));
        assert!(!repl.should_relax_index_constraints(&ns));
    }

    #[test]
    fn secondary_relaxes_constraints_until_step_up() {
        let repl = MemoryReplCoordinator::repl_set_member(false);
        let ns = Namespace::new("app", "events");
        assert!(!repl.can_accept_writes_for(&ns));
        assert!(repl.should_relax_index_constraints(&ns));

        repl.set_primary(true);
        assert!(repl.can_accept_writes_for(&ns));
        assert!(!repl.should_relax_index_constraints(&ns));
    }

    #[test]
    fn observer_keeps_write_order_and_filters_by_kind() {
        let obs = MemoryOpObserver::new();
        let build = BuildId::new();
        let coll = CollectionId::new();
        let ns = Namespace::new("app", "events");
        let specs = vec![IndexSpec::ascending("by_ts", &["ts"])];

        obs.on_start_index_build(IndexBuildOplogEntry::start(
            build,
            coll,
            ns.clone(),
            specs.clone(),
        ));
        obs.on_commit_index_build(IndexBuildOplogEntry::commit(
            build,
            coll,
            ns,
            specs,
            Timestamp(4),
        ));

        assert_eq!(obs.entries().len(), 2);
        let commits = obs.entries_of_kind(OplogEntryKind::CommitIndexBuild);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_timestamp, Timestamp(4));
    }
}
