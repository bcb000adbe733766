//! The wait point between the second and third drains of a two-phase build.
//!
//! A node that does not accept writes for the namespace must not finish a
//! two-phase build on its own: it parks here until the primary's
//! `commitIndexBuild` or `abortIndexBuild` record arrives (or step-up /
//! rollback substitutes for one). The collection and database locks are
//! released before blocking, since step-down and prepared transactions must
//! not starve behind a parked build; the driver's global intent lock keeps
//! the collection from being dropped underneath.

use crate::build_state::IndexBuildState;
use crate::coordinator::IndexBuildsCoordinator;
use crate::driver::DriverLocks;
use crate::error::{fatal_invariant, BuildError, Result};
use keel_db_core::{Namespace, OpCtx, Timestamp};
use std::sync::Arc;
use tracing::info;

impl IndexBuildsCoordinator {
    /// True when the build must park for a replicated commit/abort signal:
    /// two-phase protocol, replica-set member, and not currently accepting
    /// writes for the namespace.
    pub(crate) fn should_wait_for_commit_or_abort(
        &self,
        namespace: &Namespace,
        record: &IndexBuildState,
    ) -> bool {
        record.protocol == crate::build_state::IndexBuildProtocol::TwoPhase
            && self.repl().settings().using_repl_sets
            && !self.repl().can_accept_writes_for(namespace)
    }

    /// Park until the commit-or-abort signal, returning the commit timestamp
    /// to stamp the catalog with.
    ///
    /// `pre_abort` holds an indexing error from the earlier phases during
    /// log application. A commit signal for a locally failed build is a
    /// fatal divergence; an abort signal discards the held error.
    ///
    /// Returns a null timestamp without waiting when no signal applies (the
    /// node accepts writes and chooses its own timestamp).
    pub(crate) async fn wait_for_commit_or_abort(
        &self,
        ctx: &OpCtx,
        namespace: &Namespace,
        record: &Arc<IndexBuildState>,
        pre_abort: Result<()>,
        locks: &mut DriverLocks,
    ) -> Result<Timestamp> {
        if !self.should_wait_for_commit_or_abort(namespace, record) {
            pre_abort?;
            return Ok(Timestamp::NULL);
        }

        info!(
            build_id = %record.build_id,
            namespace = %namespace,
            "index build waiting for commit or abort before completing final phase"
        );

        // Release everything above the global intent lock before blocking.
        locks.collection = None;
        locks.database = None;

        let mut rx = record.subscribe_signal();
        let signal = tokio::select! {
            err = ctx.interrupted() => return Err(err.into()),
            terminal = rx.wait_for(|s| s.is_terminal()) => match terminal {
                Ok(signal) => signal.clone(),
                Err(_) => {
                    // The record outlives the registry entry, so the sender
                    // can only close if the record itself is going away.
                    return Err(BuildError::Interrupted(
                        "index build signal channel closed".into(),
                    ));
                }
            },
        };

        if signal.commit_ready {
            if let Err(held) = pre_abort {
                // The primary committed a build this node failed locally;
                // the catalogs have diverged and the node cannot continue.
                fatal_invariant(
                    "index build failed on this node but a commitIndexBuild record arrived from the primary",
                    &held,
                );
            }
            info!(
                build_id = %record.build_id,
                timestamp = %signal.commit_timestamp,
                collection_id = %record.collection_id,
                "committing index build"
            );
            Ok(signal.commit_timestamp)
        } else {
            let reason = signal
                .abort_reason
                .unwrap_or_else(|| "index build aborted".to_owned());
            info!(
                build_id = %record.build_id,
                timestamp = %signal.abort_timestamp,
                reason = %reason,
                pre_abort = ?pre_abort.err(),
                collection_id = %record.collection_id,
                "aborting index build"
            );
            Err(BuildError::IndexBuildAborted(reason))
        }
    }
}
