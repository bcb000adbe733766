//! Per-build mutable state: the record the registry tracks, its signal cell,
//! and the promise that delivers the final result to every joiner.
//!
//! ## Signals
//!
//! `commitIndexBuild` / `abortIndexBuild` / step-up / rollback all funnel into
//! the record's signal cell, a `watch` channel holding a [`BuildSignal`].
//! Transitions are first-signal-wins: once a build is commit-ready it cannot
//! become aborted, and vice versa. The driver's wait point observes the cell
//! with `wait_for`, so producers never need to know whether anyone is waiting.
//!
//! ## The promise
//!
//! A one-shot, multi-consumer result slot. Joiners subscribe before or after
//! fulfillment; late subscribers get the stored result immediately. The slot
//! tolerates being fulfilled with an error when no joiner exists.

use crate::error::{BuildError, Result};
use keel_db_core::{BuildId, CollectionId, IndexSpec, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// How a build coordinates across the replica set.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum IndexBuildProtocol {
    /// Completes locally without waiting for a cross-node signal.
    SinglePhase,
    /// A primary writes `startIndexBuild` and later `commitIndexBuild` (or
    /// `abortIndexBuild`); secondaries wait for the second record.
    TwoPhase,
}

impl fmt::Display for IndexBuildProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexBuildProtocol::SinglePhase => f.write_str("single-phase"),
            IndexBuildProtocol::TwoPhase => f.write_str("two-phase"),
        }
    }
}

/// Commit-quorum descriptor for two-phase builds.
///
/// The coordinator stores and reports this; actual vote tallying lives with
/// the (not yet implemented) index-build entry persistence.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitQuorum {
    VotingMembers,
    Majority,
    Nodes(u32),
}

/// Index counts reported to the waiter on completion.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct IndexCatalogStats {
    pub num_indexes_before: usize,
    pub num_indexes_after: usize,
}

/// Additional information required by `start_index_build`.
#[derive(Clone, Debug, Default)]
pub struct IndexBuildOptions {
    pub commit_quorum: Option<CommitQuorum>,
    /// True when the build was started by replicated log application on a
    /// node that was not primary at the time.
    pub repl_set_and_not_primary_at_start: bool,
}

/// The signal cell's contents. `commit_ready` and `aborted` are never both
/// true.
#[derive(Clone, Debug, Default)]
pub struct BuildSignal {
    pub commit_ready: bool,
    pub commit_timestamp: Timestamp,
    pub aborted: bool,
    pub abort_timestamp: Timestamp,
    pub abort_reason: Option<String>,
}

impl BuildSignal {
    pub fn is_terminal(&self) -> bool {
        self.commit_ready || self.aborted
    }
}

/// One in-flight index build.
#[derive(Debug)]
pub struct IndexBuildState {
    pub build_id: BuildId,
    pub collection_id: CollectionId,
    /// Cached database name; the registry keys its database tracker on it.
    pub db_name: String,
    /// Normalized specs, in request order.
    pub specs: Vec<IndexSpec>,
    /// Index names derived from `specs`, same order.
    pub index_names: Vec<String>,
    pub protocol: IndexBuildProtocol,
    commit_quorum: Mutex<Option<CommitQuorum>>,
    stats: Mutex<IndexCatalogStats>,
    signal: watch::Sender<BuildSignal>,
    promise: BuildPromise,
}

impl IndexBuildState {
    pub fn new(
        build_id: BuildId,
        collection_id: CollectionId,
        db_name: impl Into<String>,
        specs: Vec<IndexSpec>,
        protocol: IndexBuildProtocol,
        commit_quorum: Option<CommitQuorum>,
    ) -> Arc<Self> {
        let index_names = specs.iter().map(|s| s.name.clone()).collect();
        let (signal, _) = watch::channel(BuildSignal::default());
        Arc::new(Self {
            build_id,
            collection_id,
            db_name: db_name.into(),
            specs,
            index_names,
            protocol,
            commit_quorum: Mutex::new(commit_quorum),
            stats: Mutex::new(IndexCatalogStats::default()),
            signal,
            promise: BuildPromise::new(),
        })
    }

    // -- signals ------------------------------------------------------------

    pub fn signal_snapshot(&self) -> BuildSignal {
        self.signal.borrow().clone()
    }

    /// Observe the cell; used by the driver's wait point.
    pub fn subscribe_signal(&self) -> watch::Receiver<BuildSignal> {
        self.signal.subscribe()
    }

    /// Mark commit-ready at `ts`. First signal wins: returns false (and
    /// changes nothing) if the build is already commit-ready or aborted.
    pub fn try_set_commit_ready(&self, ts: Timestamp) -> bool {
        let mut changed = false;
        self.signal.send_modify(|s| {
            if !s.is_terminal() {
                s.commit_ready = true;
                s.commit_timestamp = ts;
                changed = true;
            }
        });
        changed
    }

    /// Mark aborted. First signal wins; repeated aborts are no-ops.
    pub fn try_set_aborted(&self, reason: impl Into<String>, ts: Timestamp) -> bool {
        let reason = reason.into();
        let mut changed = false;
        self.signal.send_modify(|s| {
            if !s.is_terminal() {
                s.aborted = true;
                s.abort_timestamp = ts;
                s.abort_reason = Some(reason.clone());
                changed = true;
            }
        });
        changed
    }

    // -- stats --------------------------------------------------------------

    pub fn stats(&self) -> IndexCatalogStats {
        *self.stats.lock()
    }

    pub fn set_num_indexes_before(&self, n: usize) {
        self.stats.lock().num_indexes_before = n;
    }

    pub fn set_num_indexes_after(&self, n: usize) {
        self.stats.lock().num_indexes_after = n;
    }

    // -- commit quorum ------------------------------------------------------

    pub fn commit_quorum(&self) -> Option<CommitQuorum> {
        self.commit_quorum.lock().clone()
    }

    pub fn set_commit_quorum(&self, quorum: CommitQuorum) {
        *self.commit_quorum.lock() = Some(quorum);
    }

    // -- promise ------------------------------------------------------------

    pub fn join(&self) -> BuildCompletion {
        self.promise.subscribe()
    }

    /// Deliver the final outcome. Must be called exactly once per build.
    pub fn fulfill(&self, result: Result<IndexCatalogStats>) {
        self.promise.fulfill(result);
    }
}

// ---------------------------------------------------------------------------
// BuildPromise
// ---------------------------------------------------------------------------

type BuildResult = Result<IndexCatalogStats>;

#[derive(Debug, Default)]
struct PromiseState {
    result: Option<BuildResult>,
    waiters: Vec<oneshot::Sender<BuildResult>>,
}

/// Single-producer, multi-consumer one-shot value.
#[derive(Debug, Default)]
pub struct BuildPromise {
    state: Mutex<PromiseState>,
}

impl BuildPromise {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a waiter. A waiter attached after fulfillment resolves
    /// immediately with the stored result.
    pub fn subscribe(&self) -> BuildCompletion {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        match &state.result {
            Some(result) => {
                let _ = tx.send(result.clone());
            }
            None => state.waiters.push(tx),
        }
        BuildCompletion { receiver: rx }
    }

    /// Store the result and resolve every waiter. A second fulfillment is a
    /// programming error; the first result sticks.
    pub fn fulfill(&self, result: BuildResult) {
        let waiters = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                debug_assert!(false, "build promise fulfilled twice");
                return;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            // A dropped joiner is fine; nobody has to be listening.
            let _ = waiter.send(result.clone());
        }
    }

    /// Already-fulfilled constructor for short-circuit paths.
    pub fn ready(result: BuildResult) -> BuildCompletion {
        let promise = BuildPromise::new();
        promise.fulfill(result);
        promise.subscribe()
    }
}

/// Handle to await a build's outcome.
#[derive(Debug)]
pub struct BuildCompletion {
    receiver: oneshot::Receiver<BuildResult>,
}

impl BuildCompletion {
    /// Wait for the outcome. Every joiner observes the same result.
    pub async fn wait(self) -> BuildResult {
        self.receiver.await.unwrap_or_else(|_| {
            Err(BuildError::InterruptedAtShutdown(
                "coordinator went away before fulfilling the build".into(),
            ))
        })
    }

    /// Non-blocking check; `None` until the build completes.
    pub fn try_get(&mut self) -> Option<BuildResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(
                BuildError::InterruptedAtShutdown(
                    "coordinator went away before fulfilling the build".into(),
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Arc<IndexBuildState> {
        IndexBuildState::new(
            BuildId::new(),
            CollectionId::new(),
            "app",
            vec![IndexSpec::ascending("by_ts", &["ts"])],
            IndexBuildProtocol::TwoPhase,
            None,
        )
    }

    #[test]
    fn commit_then_abort_first_wins() {
        let state = record();
        assert!(state.try_set_commit_ready(Timestamp(10)));
        assert!(!state.try_set_aborted("late", Timestamp(11)));

        let signal = state.signal_snapshot();
        assert!(signal.commit_ready);
        assert!(!signal.aborted);
        assert_eq!(signal.commit_timestamp, Timestamp(10));
    }

    #[test]
    fn abort_then_commit_first_wins() {
        let state = record();
        assert!(state.try_set_aborted("spec invalid", Timestamp::NULL));
        assert!(!state.try_set_commit_ready(Timestamp(10)));
        // Aborting again is a no-op, same effect as once.
        assert!(!state.try_set_aborted("again", Timestamp(9)));

        let signal = state.signal_snapshot();
        assert!(signal.aborted);
        assert!(!signal.commit_ready);
        assert_eq!(signal.abort_reason.as_deref(), Some("spec invalid"));
        assert!(signal.abort_timestamp.is_null());
    }

    #[tokio::test]
    async fn waiters_wake_on_signal() {
        let state = record();
        let mut rx = state.subscribe_signal();
        let waiter = tokio::spawn(async move {
            rx.wait_for(|s| s.is_terminal()).await.unwrap().clone()
        });
        state.try_set_commit_ready(Timestamp(100));
        let signal = waiter.await.unwrap();
        assert!(signal.commit_ready);
        assert_eq!(signal.commit_timestamp, Timestamp(100));
    }

    #[tokio::test]
    async fn promise_resolves_early_and_late_joiners_identically() {
        let promise = BuildPromise::new();
        let early = promise.subscribe();
        let stats = IndexCatalogStats {
            num_indexes_before: 1,
            num_indexes_after: 2,
        };
        promise.fulfill(Ok(stats));
        let late = promise.subscribe();

        assert_eq!(early.wait().await.unwrap(), stats);
        assert_eq!(late.wait().await.unwrap(), stats);
    }

    #[test]
    fn promise_tolerates_error_with_no_joiner() {
        let promise = BuildPromise::new();
        promise.fulfill(Err(BuildError::IndexBuildAborted("rollback".into())));
        let mut completion = promise.subscribe();
        assert!(matches!(
            completion.try_get(),
            Some(Err(BuildError::IndexBuildAborted(_)))
        ));
    }
}
