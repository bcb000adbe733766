//! The build driver: the phase machine that takes a registered build from
//! collection scan to catalog commit.
//!
//! ```text
//! SCAN (collection IS)
//!   ↓ collection scan + bulk insertion complete
//! DRAIN-1 (collection IS)
//!   ↓ first apply of side-table writes under intent lock
//! DRAIN-2 (collection S)
//!   ↓ second apply; writers blocked briefly
//! WAIT (no collection lock; global IX only)      ← two-phase on a non-primary
//!   ↓ commit-or-abort signal observed
//! DRAIN-3 (collection X)
//!   ↓ third apply; uniqueness constraint check
//! COMMIT (collection X)
//! ```
//!
//! Lock handoffs happen at the phase boundaries: the setup-time exclusive
//! lock is downgraded to intent for the scan, everything above the global
//! intent lock is released for WAIT, and the exclusive lock is reacquired
//! for the final drain. On the replicated (secondary) path the whole machine
//! runs with interruption restricted to process shutdown, because locally
//! aborting a build the primary may commit would diverge the node.

use crate::build_state::{IndexBuildOptions, IndexBuildProtocol, IndexBuildState};
use crate::coordinator::IndexBuildsCoordinator;
use crate::error::{fatal_invariant, BuildError, Result};
use crate::manager::{DrainYieldPolicy, ReadSource};
use keel_db_core::{
    BuildId, LockGuard, LockMode, LockResource, Namespace, OpCtx, Timestamp, TimestampBlock,
};
use keel_db_repl::IndexBuildOplogEntry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The locks a driver task holds across the phase machine. The global intent
/// lock lives for the whole build; the database and collection guards come
/// and go with the phases.
pub(crate) struct DriverLocks {
    pub(crate) _global: LockGuard,
    pub(crate) database: Option<LockGuard>,
    pub(crate) collection: Option<LockGuard>,
}

impl IndexBuildsCoordinator {
    /// Drive a registered build to completion on the calling task.
    ///
    /// Never returns an error: on any exit the record is unregistered and
    /// the promise is fulfilled exactly once with the outcome.
    pub async fn run_index_build(
        &self,
        ctx: &OpCtx,
        build_id: BuildId,
        options: &IndexBuildOptions,
    ) {
        let record = match self.registry().get(build_id) {
            Ok(record) => record,
            Err(_) => {
                debug_assert!(false, "run_index_build for unregistered build {build_id}");
                return;
            }
        };

        let result = self.run_index_build_inner(ctx, &record, options).await;

        // Unregister before fulfilling so no caller can rediscover the
        // finished build through the registry.
        self.registry().unregister(&record);
        match result {
            Ok(()) => {
                let stats = record.stats();
                info!(
                    build_id = %build_id,
                    collection_id = %record.collection_id,
                    indexes_built = record.specs.len(),
                    num_indexes_before = stats.num_indexes_before,
                    num_indexes_after = stats.num_indexes_after,
                    "index build completed successfully"
                );
                record.fulfill(Ok(stats));
            }
            Err(err) => record.fulfill(Err(err)),
        }
    }

    async fn run_index_build_inner(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
    ) -> Result<()> {
        let mut status = self.try_run_phases(ctx, record, options).await;

        if matches!(&status, Err(err) if err.is_shutdown()) {
            // Leave the build as-if the process died; the next startup
            // recovers it from the unfinished catalog entries.
            self.manager()
                .interrupt_index_build(record.build_id, "shutting down");
            if options.repl_set_and_not_primary_at_start {
                // Normal operation on the replicated path; the client is
                // the log applier, not a user.
                record.set_num_indexes_after(record.stats().num_indexes_before);
                status = Ok(());
            }
        }

        let collection = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .expect("collection must exist while an index build is registered on it");
        let namespace = collection.namespace();

        match &status {
            Err(err) => {
                self.clean_up_after_failure(ctx, record, options, &namespace, err)
                    .await;
            }
            Ok(()) => {
                let _ = self
                    .manager()
                    .tear_down_index_build(ctx, &collection, record.build_id, &|| {})
                    .await;
            }
        }

        if let Err(err) = &status {
            warn!(
                build_id = %record.build_id,
                namespace = %namespace,
                collection_id = %record.collection_id,
                error = %err,
                "index build failed"
            );
            if options.repl_set_and_not_primary_at_start
                && !matches!(err, BuildError::IndexBuildAborted(_))
            {
                // A replicated build may only stop on the primary's abort
                // signal (shutdown was mapped to resumable above). Anything
                // else means this node diverged from the primary.
                fatal_invariant("index build failed during replicated log application", err);
            }
        }
        status
    }

    /// Failure cleanup: reacquire the exclusive lock (uninterruptibly; the
    /// context may already be killed), time-stamp the catalog rollback on
    /// the replicated path, and write the `abortIndexBuild` record on a
    /// primary.
    async fn clean_up_after_failure(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
        namespace: &Namespace,
        err: &BuildError,
    ) {
        let collection = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .expect("collection must exist until the build is torn down");

        if options.repl_set_and_not_primary_at_start {
            // The abort record's timestamp stamps the catalog rollback
            // write; when the build failed for any other reason the
            // timestamp is null and the block is a no-op.
            let abort_ts = if matches!(err, BuildError::IndexBuildAborted(_)) {
                record.signal_snapshot().abort_timestamp
            } else {
                Timestamp::NULL
            };
            ctx.release_rstl_for_cleanup();
            let _db = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Database(record.db_name.clone()),
                    LockMode::IntentExclusive,
                )
                .await;
            let _coll = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Collection(record.collection_id),
                    LockMode::Exclusive,
                )
                .await;
            let _ts_block = TimestampBlock::new(ctx, abort_ts);
            let _ = self
                .manager()
                .tear_down_index_build(ctx, &collection, record.build_id, &|| {})
                .await;
            return;
        }

        let repl = self.repl();
        if repl.settings().using_repl_sets && repl.can_accept_writes_for(namespace) {
            // Still primary: tell downstream nodes to abort the same build.
            // A shutdown interruption is the exception; that build resumes
            // at startup on every node.
            let _db = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Database(record.db_name.clone()),
                    LockMode::IntentExclusive,
                )
                .await;
            let _coll = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Collection(record.collection_id),
                    LockMode::Exclusive,
                )
                .await;
            let write_abort_record =
                self.should_replicate_build(namespace, record.protocol) && !err.is_shutdown();
            let on_clean_up = || {
                if write_abort_record {
                    self.op_observer()
                        .on_abort_index_build(IndexBuildOplogEntry::abort(
                            record.build_id,
                            record.collection_id,
                            namespace.clone(),
                            record.specs.clone(),
                            err.to_string(),
                        ));
                }
            };
            let _ = self
                .manager()
                .tear_down_index_build(ctx, &collection, record.build_id, &on_clean_up)
                .await;
        } else {
            // Standalone, or a repl-set member that stepped down mid-build.
            // Drop the repl-state latch before the exclusive lock; step-down
            // blocks on the latch while prepared transactions hold
            // collection intent locks.
            ctx.release_rstl_for_cleanup();
            let _db = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Database(record.db_name.clone()),
                    LockMode::IntentExclusive,
                )
                .await;
            let _coll = self
                .locks()
                .lock_uninterruptible(
                    LockResource::Collection(record.collection_id),
                    LockMode::Exclusive,
                )
                .await;
            let _ = self
                .manager()
                .tear_down_index_build(ctx, &collection, record.build_id, &|| {})
                .await;
        }
    }

    /// Acquire the driver's locks and run the phase machine.
    async fn try_run_phases(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
    ) -> Result<()> {
        let global = self
            .locks()
            .lock(ctx, LockResource::Global, LockMode::IntentExclusive)
            .await?;
        let database = self
            .locks()
            .lock(
                ctx,
                LockResource::Database(record.db_name.clone()),
                LockMode::IntentExclusive,
            )
            .await?;
        let collection = self
            .locks()
            .lock(
                ctx,
                LockResource::Collection(record.collection_id),
                LockMode::Exclusive,
            )
            .await?;
        let mut locks = DriverLocks {
            _global: global,
            database: Some(database),
            collection: Some(collection),
        };

        if options.repl_set_and_not_primary_at_start {
            if !self.supports_two_phase_index_builds() {
                // A single-phase replicated build never parks for a signal;
                // holding the latch would only invite the step-down
                // deadlock.
                ctx.release_rstl_for_cleanup();
            }
            // Only process shutdown may interrupt the replicated path.
            let _restricted = ctx.run_uninterruptible_except_shutdown();
            self.build_index(ctx, record, options, &mut locks).await?;
        } else {
            self.build_index(ctx, record, options, &mut locks).await?;
        }

        // The exclusive lock is held again here; the count includes the
        // entries this build just committed.
        let collection = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(record.collection_id.to_string()))?;
        record.set_num_indexes_after(collection.num_indexes_total());
        Ok(())
    }

    async fn build_index(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
        locks: &mut DriverLocks,
    ) -> Result<()> {
        match record.protocol {
            IndexBuildProtocol::SinglePhase => {
                self.build_index_single_phase(ctx, record, options, locks).await
            }
            IndexBuildProtocol::TwoPhase => {
                self.build_index_two_phase(ctx, record, options, locks).await
            }
        }
    }

    /// Historical behavior: complete locally, commit immediately after the
    /// second drain with a locally synthesized timestamp.
    async fn build_index_single_phase(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
        locks: &mut DriverLocks,
    ) -> Result<()> {
        self.scan_collection_and_insert_keys(ctx, record, locks).await?;
        self.drain_side_writes_without_blocking_writes(ctx, record).await?;
        self.drain_side_writes_and_commit(ctx, record, options, locks, Timestamp::NULL)
            .await
    }

    /// Modern behavior: after the second drain, park for the replicated
    /// commit-or-abort signal unless this node chooses its own timestamp.
    async fn build_index_two_phase(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
        locks: &mut DriverLocks,
    ) -> Result<()> {
        let mut namespace = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(record.collection_id.to_string()))?
            .namespace();

        let mut pre_abort: Result<()> = Ok(());
        let phases: Result<Namespace> = async {
            self.scan_collection_and_insert_keys(ctx, record, locks).await?;
            self.drain_side_writes_without_blocking_writes(ctx, record).await
        }
        .await;
        match phases {
            Ok(ns) => namespace = ns,
            Err(err) => {
                let secondary = self.repl().settings().using_repl_sets
                    && !self.repl().can_accept_writes_for(&namespace);
                if !secondary || err.is_shutdown() {
                    return Err(err);
                }
                // Hold the failure and still enter WAIT: only the primary
                // decides this build's fate. A commit signal makes the held
                // error fatal; an abort signal discards it.
                warn!(
                    build_id = %record.build_id,
                    error = %err,
                    "index build failed before final phase during log application; waiting for abort"
                );
                pre_abort = Err(err);
            }
        }

        let commit_ts = self
            .wait_for_commit_or_abort(ctx, &namespace, record, pre_abort, locks)
            .await?;
        self.drain_side_writes_and_commit(ctx, record, options, locks, commit_ts)
            .await
    }

    /// SCAN: downgrade to an intent lock and bulk-load the collection.
    async fn scan_collection_and_insert_keys(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        locks: &mut DriverLocks,
    ) -> Result<()> {
        debug_assert!(self.manager().is_background_building(record.build_id));

        // The snapshot is abandoned with the exclusive lock; writers proceed
        // into the side table while the scan reads under intent-shared.
        locks.collection = None;
        let _scan_lock = self
            .locks()
            .lock(
                ctx,
                LockResource::Collection(record.collection_id),
                LockMode::IntentShared,
            )
            .await?;
        let collection = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(record.collection_id.to_string()))?;
        self.manager()
            .start_building_index(ctx, &collection, record.build_id)
            .await?;
        debug!(build_id = %record.build_id, phase = "scan", "collection scan and bulk insertion complete");
        Ok(())
    }

    /// DRAIN-1 (intent lock) and DRAIN-2 (shared lock, writers blocked).
    /// Returns the namespace as of the second drain; the collection may have
    /// been renamed since setup, and WAIT needs the current name for the
    /// replication-role check.
    async fn drain_side_writes_without_blocking_writes(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
    ) -> Result<Namespace> {
        {
            let _drain_lock = self
                .locks()
                .lock(
                    ctx,
                    LockResource::Collection(record.collection_id),
                    LockMode::IntentShared,
                )
                .await?;
            self.manager()
                .drain_background_writes(
                    ctx,
                    record.build_id,
                    ReadSource::Unset,
                    DrainYieldPolicy::Yield,
                )
                .await?;
        }
        debug!(build_id = %record.build_id, phase = "drain-1", "first side-table drain complete");

        let namespace;
        {
            let _drain_lock = self
                .locks()
                .lock(
                    ctx,
                    LockResource::Collection(record.collection_id),
                    LockMode::Shared,
                )
                .await?;
            self.manager()
                .drain_background_writes(
                    ctx,
                    record.build_id,
                    ReadSource::Unset,
                    DrainYieldPolicy::NoYield,
                )
                .await?;
            namespace = self
                .catalog()
                .lookup_by_id(record.collection_id)
                .ok_or_else(|| BuildError::NamespaceNotFound(record.collection_id.to_string()))?
                .namespace();
        }
        debug!(build_id = %record.build_id, phase = "drain-2", "second side-table drain complete");
        Ok(namespace)
    }

    /// DRAIN-3 and COMMIT under the reacquired exclusive lock.
    async fn drain_side_writes_and_commit(
        &self,
        ctx: &OpCtx,
        record: &Arc<IndexBuildState>,
        options: &IndexBuildOptions,
        locks: &mut DriverLocks,
        commit_ts: Timestamp,
    ) -> Result<()> {
        if options.repl_set_and_not_primary_at_start {
            // Step-down blocks on the repl-state latch; holding it while
            // waiting for the exclusive lock deadlocks against a prepared
            // transaction's intent lock.
            ctx.release_rstl_for_cleanup();
        }
        if locks.database.is_none() {
            locks.database = Some(
                self.locks()
                    .lock(
                        ctx,
                        LockResource::Database(record.db_name.clone()),
                        LockMode::IntentExclusive,
                    )
                    .await?,
            );
        }
        locks.collection = Some(
            self.locks()
                .lock(
                    ctx,
                    LockResource::Collection(record.collection_id),
                    LockMode::Exclusive,
                )
                .await?,
        );

        let collection = self
            .catalog()
            .lookup_by_id(record.collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(record.collection_id.to_string()))?;
        let namespace = collection.namespace();

        self.manager()
            .drain_background_writes(
                ctx,
                record.build_id,
                ReadSource::Unset,
                DrainYieldPolicy::NoYield,
            )
            .await?;
        debug!(build_id = %record.build_id, phase = "drain-3", "final side-table drain complete");

        self.manager()
            .check_index_constraint_violations(ctx, record.build_id)
            .await?;

        let repl = self.repl();
        if record.protocol == IndexBuildProtocol::TwoPhase
            && repl.settings().using_repl_sets
            && !repl.can_accept_writes_for(&namespace)
        {
            // A node applying the log finishes only with the primary's
            // timestamp.
            assert!(
                !commit_ts.is_null(),
                "two-phase index build on a non-primary requires a replicated commit timestamp: {}",
                record.build_id
            );
        }

        let replicate = self.should_replicate_build(&namespace, record.protocol);
        let on_commit = |ts: Timestamp| {
            if replicate {
                self.op_observer()
                    .on_commit_index_build(IndexBuildOplogEntry::commit(
                        record.build_id,
                        record.collection_id,
                        namespace.clone(),
                        record.specs.clone(),
                        ts,
                    ));
            }
        };
        let _ts_block = TimestampBlock::new(ctx, commit_ts);
        self.manager()
            .commit_index_build(ctx, &collection, record.build_id, &|_spec| {}, &on_commit)
            .await?;
        debug!(build_id = %record.build_id, phase = "commit", "index build committed");
        Ok(())
    }
}
