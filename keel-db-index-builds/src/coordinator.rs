//! The coordinator façade: start/join/commit/abort, cross-node signals,
//! in-progress queries, and the diagnostic dump.
//!
//! One coordinator exists per server. It owns the registry, the
//! `IndexBuildsManager` singleton, and handles the lifecycle signals the
//! replication layer delivers: `commitIndexBuild` / `abortIndexBuild` log
//! records, step-up, and rollback. Build results travel through per-build
//! promises, so every joiner observes the same outcome.

use crate::build_state::{
    BuildCompletion, BuildPromise, CommitQuorum, IndexBuildOptions, IndexBuildProtocol,
};
use crate::config::IndexBuildsConfig;
use crate::error::{BuildError, Result};
use crate::manager::{IndexBuildsManager, LocalIndexBuildsManager};
use crate::registry::BuildRegistry;
use keel_db_core::{
    BuildId, CollectionCatalog, CollectionId, IndexSpec, LockManager, Namespace, OpCtx, Timestamp,
};
use keel_db_repl::{OpObserver, ReplicationCoordinator};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of `start_index_build`.
#[derive(Debug)]
pub enum StartedIndexBuild {
    /// Every requested spec was redundant; the completion is already
    /// resolved and no record was registered.
    AlreadySatisfied(BuildCompletion),
    /// The build is registered and set up; the caller must drive it by
    /// scheduling `run_index_build` on a worker task.
    Registered(BuildCompletion),
}

impl StartedIndexBuild {
    pub fn needs_run(&self) -> bool {
        matches!(self, StartedIndexBuild::Registered(_))
    }

    pub fn completion(self) -> BuildCompletion {
        match self {
            StartedIndexBuild::AlreadySatisfied(c) | StartedIndexBuild::Registered(c) => c,
        }
    }
}

/// Coordinator for all things index builds.
#[derive(Debug)]
pub struct IndexBuildsCoordinator {
    registry: Arc<BuildRegistry>,
    manager: Arc<dyn IndexBuildsManager>,
    catalog: Arc<CollectionCatalog>,
    locks: LockManager,
    repl: Arc<dyn ReplicationCoordinator>,
    op_observer: Arc<dyn OpObserver>,
    config: IndexBuildsConfig,
}

impl IndexBuildsCoordinator {
    /// Coordinator with the in-process builder.
    pub fn new(
        catalog: Arc<CollectionCatalog>,
        locks: LockManager,
        repl: Arc<dyn ReplicationCoordinator>,
        op_observer: Arc<dyn OpObserver>,
        config: IndexBuildsConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(LocalIndexBuildsManager::new(catalog.clone()));
        Self::with_manager(manager, catalog, locks, repl, op_observer, config)
    }

    /// Coordinator over a caller-supplied builder.
    pub fn with_manager(
        manager: Arc<dyn IndexBuildsManager>,
        catalog: Arc<CollectionCatalog>,
        locks: LockManager,
        repl: Arc<dyn ReplicationCoordinator>,
        op_observer: Arc<dyn OpObserver>,
        config: IndexBuildsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(BuildRegistry::new()),
            manager,
            catalog,
            locks,
            repl,
            op_observer,
            config,
        })
    }

    pub(crate) fn registry(&self) -> &Arc<BuildRegistry> {
        &self.registry
    }

    pub(crate) fn manager(&self) -> &Arc<dyn IndexBuildsManager> {
        &self.manager
    }

    pub(crate) fn catalog(&self) -> &Arc<CollectionCatalog> {
        &self.catalog
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn repl(&self) -> &Arc<dyn ReplicationCoordinator> {
        &self.repl
    }

    pub(crate) fn op_observer(&self) -> &Arc<dyn OpObserver> {
        &self.op_observer
    }

    /// True when two-phase builds may write replication records.
    pub fn supports_two_phase_index_builds(&self) -> bool {
        self.config.enable_two_phase_index_builds
    }

    /// True when this build should produce replication records: two-phase
    /// selected, two-phase enabled server-wide, and the node accepts writes
    /// for the namespace.
    pub(crate) fn should_replicate_build(
        &self,
        namespace: &Namespace,
        protocol: IndexBuildProtocol,
    ) -> bool {
        self.config.enable_two_phase_index_builds
            && protocol == IndexBuildProtocol::TwoPhase
            && self.repl.can_accept_writes_for(namespace)
    }

    // -----------------------------------------------------------------------
    // Starting and joining
    // -----------------------------------------------------------------------

    /// Set up the in-memory and persisted state of an index build.
    ///
    /// Runs the setup pipeline synchronously under the collection exclusive
    /// lock and returns a completion the caller can await. When the result is
    /// [`StartedIndexBuild::Registered`] the caller is expected to schedule
    /// [`Self::run_index_build`] on a worker task.
    pub async fn start_index_build(
        &self,
        ctx: &OpCtx,
        db_name: &str,
        collection_id: CollectionId,
        specs: Vec<IndexSpec>,
        build_id: BuildId,
        protocol: IndexBuildProtocol,
        options: &IndexBuildOptions,
    ) -> Result<StartedIndexBuild> {
        self.register_and_set_up_index_build(
            ctx,
            db_name,
            collection_id,
            specs,
            build_id,
            protocol,
            options,
        )
        .await
    }

    /// Start a build and drive it on a spawned task. The returned completion
    /// resolves with the build's outcome.
    pub async fn spawn_index_build(
        self: Arc<Self>,
        ctx: &OpCtx,
        db_name: &str,
        collection_id: CollectionId,
        specs: Vec<IndexSpec>,
        build_id: BuildId,
        protocol: IndexBuildProtocol,
        options: IndexBuildOptions,
    ) -> Result<BuildCompletion> {
        let started = self
            .start_index_build(
                ctx,
                db_name,
                collection_id,
                specs,
                build_id,
                protocol,
                &options,
            )
            .await?;
        match started {
            StartedIndexBuild::AlreadySatisfied(completion) => Ok(completion),
            StartedIndexBuild::Registered(completion) => {
                tokio::spawn(async move {
                    let driver_ctx = OpCtx::new();
                    self.run_index_build(&driver_ctx, build_id, &options).await;
                });
                Ok(completion)
            }
        }
    }

    /// Wait for the build identified by `build_id` to complete. Unknown
    /// builds return quietly (the build finished before the caller joined),
    /// and the build's error never surfaces here; errors travel through the
    /// completion returned by `start_index_build`.
    pub async fn join_index_build(&self, build_id: BuildId) {
        let Ok(record) = self.registry.get(build_id) else {
            return;
        };
        let outcome = record.join().wait().await;
        info!(build_id = %build_id, success = outcome.is_ok(), "index build joined");
    }

    // -----------------------------------------------------------------------
    // Cross-node signals
    // -----------------------------------------------------------------------

    /// Apply a `commitIndexBuild` log record: mark the build commit-ready at
    /// the record's timestamp and wake the driver.
    ///
    /// The commit timestamp must already be installed on the operation
    /// context by the log applier.
    pub fn commit_index_build(
        &self,
        ctx: &OpCtx,
        _specs: &[IndexSpec],
        build_id: BuildId,
    ) -> Result<()> {
        let record = self.registry.get(build_id)?;
        let ts = ctx.commit_timestamp();
        assert!(
            !ts.is_null(),
            "commitIndexBuild applied without a commit timestamp: {build_id}"
        );
        if record.try_set_commit_ready(ts) {
            info!(build_id = %build_id, timestamp = %ts, "index build signaled to commit");
        } else {
            // The abort signal won; this commit is a no-op.
            debug!(build_id = %build_id, "commit signal ignored for terminal build");
        }
        Ok(())
    }

    /// Best-effort abort by build id. Signals the underlying builder first
    /// (which may not exist yet), then the coordinator record. Idempotent.
    pub fn abort_index_build_by_build_id(&self, ctx: &OpCtx, build_id: BuildId, reason: &str) {
        self.manager.abort_index_build(build_id, reason);

        if let Ok(record) = self.registry.get(build_id) {
            // The abort timestamp comes from the log record's surrounding
            // oplog entry when one is being applied; null otherwise.
            if record.try_set_aborted(reason, ctx.commit_timestamp()) {
                info!(build_id = %build_id, reason, "index build signaled to abort");
            }
        }
    }

    /// Abort every build on the collection and wait until none remain. The
    /// caller must hold a `ScopedStopNewCollectionIndexBuilds` so no new
    /// build can register while the existing ones drain.
    pub async fn abort_collection_index_builds(&self, collection_id: CollectionId, reason: &str) {
        assert!(
            self.registry.is_collection_disallowed(collection_id),
            "abort_collection_index_builds requires a scoped blocker on the collection"
        );
        let builds = self.registry.builds_for_collection(collection_id);
        for record in &builds {
            self.manager.abort_index_build(record.build_id, reason);
            record.try_set_aborted(reason, Timestamp::NULL);
        }
        self.registry
            .await_no_builds_for_collection(collection_id)
            .await;
    }

    /// Abort every build on the database and wait until none remain. The
    /// caller must hold a `ScopedStopNewDatabaseIndexBuilds`.
    pub async fn abort_database_index_builds(&self, db_name: &str, reason: &str) {
        assert!(
            self.registry.is_db_disallowed(db_name),
            "abort_database_index_builds requires a scoped blocker on the database"
        );
        let builds = self.registry.builds_for_db(db_name);
        for record in &builds {
            self.manager.abort_index_build(record.build_id, reason);
            record.try_set_aborted(reason, Timestamp::NULL);
        }
        self.registry.await_no_builds_for_db(db_name).await;
    }

    /// Step-up: unblock builds that were waiting for a replicated signal.
    /// As the new primary this node chooses its own commit timestamps, so the
    /// records are marked commit-ready with a null timestamp.
    pub fn on_step_up(&self) {
        let builds = self.registry.active_builds();
        info!(active = builds.len(), "stepping up to primary; unblocking index builds");
        for record in builds {
            if record.try_set_commit_ready(Timestamp::NULL) {
                debug!(build_id = %record.build_id, "index build unblocked for local commit");
            }
        }
    }

    /// Rollback: force every build into the aborted state with a null
    /// timestamp. The recovery algorithm decides later whether to undo or
    /// resume each build based on the log.
    pub fn on_rollback(&self) {
        let builds = self.registry.active_builds();
        info!(active = builds.len(), "entering rollback; aborting index builds");
        for record in builds {
            if record.try_set_aborted("rollback", Timestamp::NULL) {
                debug!(build_id = %record.build_id, "index build signaled to abort for rollback");
            }
        }
    }

    /// Wait for all builds to stop after they were interrupted for shutdown.
    /// Call only once no new builds can start.
    pub async fn wait_for_all_index_builds_to_stop_for_shutdown(&self) {
        for db in self.registry.tracked_db_names() {
            self.registry.await_no_builds_for_db(&db).await;
        }
    }

    // -----------------------------------------------------------------------
    // Commit quorum
    // -----------------------------------------------------------------------

    /// Replace the commit quorum of the build managing `index_names` on
    /// `namespace`.
    ///
    /// Checking the new quorum against the replica-set config is part of the
    /// disabled quorum-voting path; until index-build entries are persisted
    /// the descriptor is stored unchecked.
    pub fn set_commit_quorum(
        &self,
        namespace: &Namespace,
        index_names: &[&str],
        quorum: CommitQuorum,
    ) -> Result<()> {
        let collection = self
            .catalog
            .lookup_by_namespace(namespace)
            .ok_or_else(|| BuildError::NamespaceNotFound(namespace.to_string()))?;
        let builds = self.registry.builds_for_collection(collection.id());
        let record = builds
            .iter()
            .find(|r| {
                index_names
                    .iter()
                    .all(|name| r.index_names.iter().any(|n| n == name))
            })
            .ok_or_else(|| {
                BuildError::IndexNotFound(format!(
                    "no index build in progress on {namespace} managing {index_names:?}"
                ))
            })?;
        record.set_commit_quorum(quorum);
        Ok(())
    }

    /// Record a member's commit-quorum vote.
    ///
    /// Disabled: vote tallying requires the persisted index-build entries,
    /// which are not written yet. Callers must not rely on quorum voting.
    pub fn vote_commit_index_build(&self, build_id: BuildId, member: &str) -> Result<()> {
        Err(BuildError::NotYetImplemented(format!(
            "voteCommitIndexBuild({build_id}, {member}) requires persisted index-build entries"
        )))
    }

    /// Replica-set reconfig hook. Re-checking quorum satisfiability is part
    /// of the disabled quorum-voting path; today this only logs.
    pub fn on_replica_set_reconfig(&self) {
        debug!(
            active = self.registry.num_active(),
            "replica-set reconfig observed; commit-quorum re-evaluation is disabled"
        );
    }

    /// Startup hook for re-scheduling unfinished two-phase builds found in
    /// the catalog. Not wired up yet; startup uses
    /// `start_index_rebuild_for_recovery` instead.
    pub fn recover_index_builds(&self) {
        debug!("recover_index_builds: no-op; startup drives recovery rebuilds directly");
    }

    // -----------------------------------------------------------------------
    // Predicates, counters, waits
    // -----------------------------------------------------------------------

    pub fn in_prog_for_collection(&self, collection_id: CollectionId) -> bool {
        self.registry.in_prog_for_collection(collection_id)
    }

    pub fn in_prog_for_db(&self, db_name: &str) -> bool {
        self.registry.in_prog_for_db(db_name)
    }

    pub fn num_in_prog_for_db(&self, db_name: &str) -> usize {
        self.registry.num_in_prog_for_db(db_name)
    }

    /// Error if any build is running anywhere.
    pub fn assert_no_index_build_in_progress(&self) -> Result<()> {
        let active = self.registry.num_active();
        if active > 0 {
            return Err(BuildError::BackgroundOperationInProgressForDatabase(format!(
                "cannot perform operation: {active} index builds are currently running"
            )));
        }
        Ok(())
    }

    /// Error if any build is running on the collection.
    pub fn assert_no_index_build_in_prog_for_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<()> {
        if self.in_prog_for_collection(collection_id) {
            return Err(BuildError::BackgroundOperationInProgressForNamespace(
                format!(
                    "cannot perform operation: an index build is currently running on collection {collection_id}"
                ),
            ));
        }
        Ok(())
    }

    /// Error if any build is running on the database.
    pub fn assert_no_bg_op_in_prog_for_db(&self, db_name: &str) -> Result<()> {
        if self.in_prog_for_db(db_name) {
            return Err(BuildError::BackgroundOperationInProgressForDatabase(format!(
                "cannot perform operation: an index build is currently running on database {db_name}"
            )));
        }
        Ok(())
    }

    /// Wait until no builds remain on the collection.
    pub async fn await_no_index_build_in_progress_for_collection(
        &self,
        collection_id: CollectionId,
    ) {
        self.registry
            .await_no_builds_for_collection(collection_id)
            .await;
    }

    /// Wait until no builds remain on the database.
    pub async fn await_no_bg_op_in_prog_for_db(&self, db_name: &str) {
        self.registry.await_no_builds_for_db(db_name).await;
    }

    /// Diagnostic snapshot: collections with builds and per-database counts.
    pub fn dump(&self) -> serde_json::Value {
        let collections: Vec<serde_json::Value> = self
            .registry
            .collection_summaries()
            .into_iter()
            .map(|(id, names)| json!({ "collection": id.to_string(), "indexes": names }))
            .collect();
        let databases: serde_json::Map<String, serde_json::Value> = self
            .registry
            .database_counts()
            .into_iter()
            .map(|(db, count)| (db, json!(count)))
            .collect();
        json!({
            "backgroundJobsInProgress": collections,
            "databases": databases,
        })
    }

    /// Teardown invariant: all registry mappings and both blocker counters
    /// must be empty.
    pub fn verify_no_index_builds(&self) -> std::result::Result<(), String> {
        self.registry.verify_quiescent()
    }

    /// Already-satisfied completion for short-circuit paths.
    pub(crate) fn ready_completion(&self, num_indexes: usize) -> BuildCompletion {
        BuildPromise::ready(Ok(crate::build_state::IndexCatalogStats {
            num_indexes_before: num_indexes,
            num_indexes_after: num_indexes,
        }))
    }
}

impl Drop for IndexBuildsCoordinator {
    fn drop(&mut self) {
        // Builds must have drained before the server lets the coordinator
        // go. Skip the check when already unwinding so a test failure is not
        // masked by a panic-in-drop abort.
        if std::thread::panicking() {
            return;
        }
        if let Err(state) = self.registry.verify_quiescent() {
            debug_assert!(false, "coordinator dropped with active state: {state}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_db_core::CollectionOptions;
    use keel_db_repl::{MemoryOpObserver, MemoryReplCoordinator};

    fn coordinator() -> (Arc<IndexBuildsCoordinator>, Arc<CollectionCatalog>) {
        let catalog = CollectionCatalog::new();
        let coordinator = IndexBuildsCoordinator::new(
            catalog.clone(),
            LockManager::new(),
            Arc::new(MemoryReplCoordinator::standalone()),
            Arc::new(MemoryOpObserver::new()),
            IndexBuildsConfig::default(),
        );
        (coordinator, catalog)
    }

    #[tokio::test]
    async fn join_unknown_build_returns_quietly() {
        let (coordinator, _catalog) = coordinator();
        coordinator.join_index_build(BuildId::new()).await;
    }

    #[tokio::test]
    async fn commit_signal_for_unknown_build_errors() {
        let (coordinator, _catalog) = coordinator();
        let ctx = OpCtx::new();
        let _block = keel_db_core::TimestampBlock::new(&ctx, Timestamp(5));
        let err = coordinator
            .commit_index_build(&ctx, &[], BuildId::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::NoSuchBuild(_)));
    }

    #[tokio::test]
    async fn abort_by_build_id_is_idempotent() {
        let (coordinator, _catalog) = coordinator();
        let ctx = OpCtx::new();
        // Unknown build: best-effort no-op.
        coordinator.abort_index_build_by_build_id(&ctx, BuildId::new(), "nothing there");
    }

    #[tokio::test]
    async fn assertions_reflect_registry_state() {
        let (coordinator, catalog) = coordinator();
        let collection = catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions::default(),
        );
        assert!(coordinator.assert_no_index_build_in_progress().is_ok());
        assert!(coordinator.assert_no_bg_op_in_prog_for_db("app").is_ok());
        assert!(coordinator
            .assert_no_index_build_in_prog_for_collection(collection.id())
            .is_ok());
        assert_eq!(coordinator.num_in_prog_for_db("app"), 0);
        assert!(coordinator.verify_no_index_builds().is_ok());
    }

    #[tokio::test]
    async fn dump_renders_empty_state() {
        let (coordinator, _catalog) = coordinator();
        let dump = coordinator.dump();
        assert_eq!(dump["backgroundJobsInProgress"], json!([]));
        assert_eq!(dump["databases"], json!({}));
    }

    #[tokio::test]
    async fn vote_commit_is_a_well_defined_stub() {
        let (coordinator, _catalog) = coordinator();
        let err = coordinator
            .vote_commit_index_build(BuildId::new(), "node-2:27017")
            .unwrap_err();
        assert!(matches!(err, BuildError::NotYetImplemented(_)));
        coordinator.on_replica_set_reconfig();
        coordinator.recover_index_builds();
    }

    #[tokio::test]
    async fn set_commit_quorum_requires_matching_build() {
        let (coordinator, catalog) = coordinator();
        let _collection = catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions::default(),
        );
        let err = coordinator
            .set_commit_quorum(
                &Namespace::new("app", "events"),
                &["by_ts"],
                CommitQuorum::Majority,
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::IndexNotFound(_)));

        let err = coordinator
            .set_commit_quorum(
                &Namespace::new("app", "missing"),
                &["by_ts"],
                CommitQuorum::Majority,
            )
            .unwrap_err();
        assert!(matches!(err, BuildError::NamespaceNotFound(_)));
    }

    #[test]
    fn started_index_build_accessors() {
        let completion = BuildPromise::ready(Ok(Default::default()));
        let started = StartedIndexBuild::AlreadySatisfied(completion);
        assert!(!started.needs_run());
        let _ = started.completion();
    }
}
