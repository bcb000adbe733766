//! The setup pipeline: what happens between "a caller asked for indexes" and
//! "a registered build with unfinished catalog entries".
//!
//! All of it runs under the collection exclusive lock, in a fixed order:
//! load the collection by id, normalize the specs, drop the redundant ones,
//! check uniqueness against the shard key, register atomically against the
//! blocker counters and the name-conflict rule, then hand the specs to the
//! manager to place the unfinished catalog entries (writing the
//! `startIndexBuild` record on a write-accepting node running two-phase).

use crate::build_state::{IndexBuildOptions, IndexBuildProtocol, IndexBuildState};
use crate::coordinator::{IndexBuildsCoordinator, StartedIndexBuild};
use crate::error::{BuildError, Result};
use crate::manager::{IndexConstraints, SetupOptions};
use keel_db_core::{
    BuildId, Collection, CollectionId, IndexSpec, LockMode, LockResource, Namespace, OpCtx,
};
use keel_db_repl::IndexBuildOplogEntry;
use std::sync::Arc;
use tracing::{debug, info};

impl IndexBuildsCoordinator {
    pub(crate) async fn register_and_set_up_index_build(
        &self,
        ctx: &OpCtx,
        db_name: &str,
        collection_id: CollectionId,
        specs: Vec<IndexSpec>,
        build_id: BuildId,
        protocol: IndexBuildProtocol,
        options: &IndexBuildOptions,
    ) -> Result<StartedIndexBuild> {
        let _db_lock = self
            .locks()
            .lock(
                ctx,
                LockResource::Database(db_name.to_owned()),
                LockMode::IntentExclusive,
            )
            .await?;
        let _coll_lock = self
            .locks()
            .lock(
                ctx,
                LockResource::Collection(collection_id),
                LockMode::Exclusive,
            )
            .await?;

        let collection = self.catalog().lookup_by_id(collection_id).ok_or_else(|| {
            BuildError::NamespaceNotFound(format!("collection {collection_id} in {db_name}"))
        })?;
        let namespace = collection.namespace();
        debug_assert_eq!(namespace.db(), db_name);

        let filtered = self.add_defaults_and_filter_existing(&collection, &namespace, specs)?;
        if filtered.is_empty() {
            // Every requested index is already built or building. Resolve
            // immediately without registering anything.
            debug!(build_id = %build_id, namespace = %namespace, "all requested indexes already satisfied");
            return Ok(StartedIndexBuild::AlreadySatisfied(
                self.ready_completion(collection.num_indexes_total()),
            ));
        }

        let record = IndexBuildState::new(
            build_id,
            collection_id,
            db_name,
            filtered.clone(),
            protocol,
            options.commit_quorum.clone(),
        );
        record.set_num_indexes_before(collection.num_indexes_total());

        // Atomic with the blocker and name-conflict checks.
        self.registry().register(record.clone())?;

        let replicate_start = self.should_replicate_build(&namespace, protocol);
        let on_init = |placed: &[IndexSpec]| -> Result<()> {
            if replicate_start {
                self.op_observer().on_start_index_build(IndexBuildOplogEntry::start(
                    build_id,
                    collection_id,
                    namespace.clone(),
                    placed.to_vec(),
                ));
            }
            Ok(())
        };
        let constraints = if self.repl().should_relax_index_constraints(&namespace) {
            IndexConstraints::Relax
        } else {
            IndexConstraints::Enforce
        };
        let setup_options = SetupOptions {
            constraints,
            protocol,
            for_recovery: false,
        };
        let status = self
            .manager()
            .set_up_index_build(ctx, &collection, &filtered, build_id, setup_options, &on_init)
            .await;

        match status {
            Ok(()) => {
                info!(
                    build_id = %build_id,
                    namespace = %namespace,
                    collection_id = %collection_id,
                    indexes = filtered.len(),
                    protocol = %protocol,
                    "index build registered"
                );
                Ok(StartedIndexBuild::Registered(record.join()))
            }
            Err(err) => {
                // Unregister before resolving so no caller can rediscover
                // the failed build.
                let _ = self
                    .manager()
                    .tear_down_index_build(ctx, &collection, build_id, &|| {})
                    .await;
                self.registry().unregister(&record);

                let already_satisfied = matches!(err, BuildError::IndexAlreadyExists(_))
                    || (constraints == IndexConstraints::Relax
                        && matches!(
                            err,
                            BuildError::IndexOptionsConflict(_)
                                | BuildError::IndexKeySpecsConflict(_)
                        ));
                if already_satisfied {
                    debug!(build_id = %build_id, error = %err, "ignoring indexing error");
                    let before = record.stats().num_indexes_before;
                    return Ok(StartedIndexBuild::AlreadySatisfied(
                        self.ready_completion(before),
                    ));
                }

                // A joiner may already hold the completion; give it the
                // setup error too.
                record.fulfill(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Normalize and prune the requested specs.
    ///
    /// During replicated log application the specs were normalized by the
    /// primary already and must not be modified further.
    fn add_defaults_and_filter_existing(
        &self,
        collection: &Arc<Collection>,
        namespace: &Namespace,
        specs: Vec<IndexSpec>,
    ) -> Result<Vec<IndexSpec>> {
        let repl = self.repl();
        if repl.settings().using_repl_sets && !repl.can_accept_writes_for(namespace) {
            return Ok(specs);
        }

        let mut filtered = Vec::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            let spec = spec.with_default_collation(collection.default_collation());
            if let Some(existing) = collection.find_index_by_name(&spec.name) {
                if existing.spec.same_index(&spec) {
                    // Ready or building; either way the request is redundant.
                    continue;
                }
                return Err(if existing.spec.keys != spec.keys {
                    BuildError::IndexKeySpecsConflict(format!(
                        "index {spec} conflicts with existing key pattern of {}",
                        existing.spec
                    ))
                } else {
                    BuildError::IndexOptionsConflict(format!(
                        "index {spec} conflicts with existing options of {}",
                        existing.spec
                    ))
                });
            }
            filtered.push(spec);
        }

        if let Some(shard_key) = collection.shard_key() {
            for spec in filtered.iter().filter(|s| s.unique) {
                if !spec.is_prefixed_by(shard_key) {
                    return Err(BuildError::CannotCreateIndex(format!(
                        "cannot create unique index {spec} on {namespace}: the shard key \
                         {shard_key:?} must be a prefix of the unique index key"
                    )));
                }
            }
        }
        Ok(filtered)
    }

    // -----------------------------------------------------------------------
    // Foreground helpers
    // -----------------------------------------------------------------------

    /// Build indexes to completion on the caller's task, under the exclusive
    /// collection lock the caller already holds. Two-phase nodes write the
    /// `startIndexBuild` and `commitIndexBuild` records together at commit;
    /// nothing is written on failure.
    pub async fn create_indexes(
        &self,
        ctx: &OpCtx,
        collection_id: CollectionId,
        specs: Vec<IndexSpec>,
    ) -> Result<()> {
        let collection = self
            .catalog()
            .lookup_by_id(collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(collection_id.to_string()))?;
        debug_assert!(self
            .locks()
            .is_locked(&LockResource::Collection(collection_id), LockMode::Exclusive));
        let namespace = collection.namespace();
        let build_id = BuildId::new();
        let protocol = if self.supports_two_phase_index_builds() {
            IndexBuildProtocol::TwoPhase
        } else {
            IndexBuildProtocol::SinglePhase
        };

        let result = self
            .create_indexes_inner(ctx, &collection, &namespace, &specs, build_id, protocol)
            .await;
        // Builder state is released whether or not the build committed.
        let _ = self
            .manager()
            .tear_down_index_build(ctx, &collection, build_id, &|| {})
            .await;
        result
    }

    async fn create_indexes_inner(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        namespace: &Namespace,
        specs: &[IndexSpec],
        build_id: BuildId,
        protocol: IndexBuildProtocol,
    ) -> Result<()> {
        let setup_options = SetupOptions {
            constraints: IndexConstraints::Enforce,
            protocol,
            for_recovery: false,
        };
        self.manager()
            .set_up_index_build(
                ctx,
                collection,
                specs,
                build_id,
                setup_options,
                &|_specs: &[IndexSpec]| Ok(()),
            )
            .await?;
        self.manager()
            .start_building_index(ctx, collection, build_id)
            .await?;
        self.manager()
            .check_index_constraint_violations(ctx, build_id)
            .await?;

        let replicate = self.should_replicate_build(namespace, protocol);
        let on_commit = |ts: keel_db_core::Timestamp| {
            if replicate {
                self.op_observer().on_start_index_build(IndexBuildOplogEntry::start(
                    build_id,
                    collection.id(),
                    namespace.clone(),
                    specs.to_vec(),
                ));
                self.op_observer().on_commit_index_build(IndexBuildOplogEntry::commit(
                    build_id,
                    collection.id(),
                    namespace.clone(),
                    specs.to_vec(),
                    ts,
                ));
            }
        };
        self.manager()
            .commit_index_build(ctx, collection, build_id, &|_spec| {}, &on_commit)
            .await
    }

    /// Catalog-only fast path for collections with no documents: the entries
    /// go in ready immediately, with the same replication-record discipline
    /// as `create_indexes`.
    pub async fn create_indexes_on_empty_collection(
        &self,
        ctx: &OpCtx,
        collection_id: CollectionId,
        specs: Vec<IndexSpec>,
    ) -> Result<()> {
        let collection = self
            .catalog()
            .lookup_by_id(collection_id)
            .ok_or_else(|| BuildError::NamespaceNotFound(collection_id.to_string()))?;
        assert_eq!(
            collection.num_records(),
            0,
            "create_indexes_on_empty_collection on a non-empty collection"
        );
        let namespace = collection.namespace();
        let build_id = BuildId::new();
        let protocol = if self.supports_two_phase_index_builds() {
            IndexBuildProtocol::TwoPhase
        } else {
            IndexBuildProtocol::SinglePhase
        };

        let ts = match ctx.commit_timestamp() {
            ts if ts.is_null() => self.catalog().next_timestamp(),
            ts => ts,
        };
        if self.should_replicate_build(&namespace, protocol) {
            self.op_observer().on_start_index_build(IndexBuildOplogEntry::start(
                build_id,
                collection_id,
                namespace.clone(),
                specs.clone(),
            ));
            self.op_observer().on_commit_index_build(IndexBuildOplogEntry::commit(
                build_id,
                collection_id,
                namespace.clone(),
                specs.clone(),
                ts,
            ));
        }
        for spec in &specs {
            spec.validate()?;
            collection.add_unfinished_index(spec.clone(), build_id)?;
            collection
                .mark_index_ready(&spec.name, ts)
                .map_err(BuildError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::build_state::IndexBuildOptions;
    use crate::config::IndexBuildsConfig;
    use crate::coordinator::IndexBuildsCoordinator;
    use crate::error::BuildError;
    use keel_db_core::{
        BuildId, CollectionCatalog, CollectionOptions, IndexSpec, LockManager, LockMode,
        LockResource, Namespace, OpCtx,
    };
    use keel_db_repl::{MemoryOpObserver, MemoryReplCoordinator, OplogEntryKind};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        catalog: Arc<CollectionCatalog>,
        locks: LockManager,
        observer: Arc<MemoryOpObserver>,
        coordinator: Arc<IndexBuildsCoordinator>,
    }

    fn fixture(repl: MemoryReplCoordinator) -> Fixture {
        let catalog = CollectionCatalog::new();
        let locks = LockManager::new();
        let observer = Arc::new(MemoryOpObserver::new());
        let coordinator = IndexBuildsCoordinator::new(
            catalog.clone(),
            locks.clone(),
            Arc::new(repl),
            observer.clone(),
            IndexBuildsConfig::default(),
        );
        Fixture {
            catalog,
            locks,
            observer,
            coordinator,
        }
    }

    #[tokio::test]
    async fn create_indexes_builds_foreground_and_replicates() {
        let f = fixture(MemoryReplCoordinator::repl_set_member(true));
        let collection = f.catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions::default(),
        );
        collection.insert_document(json!({"a": 1}));

        let ctx = OpCtx::new();
        let _x = f
            .locks
            .lock(
                &ctx,
                LockResource::Collection(collection.id()),
                LockMode::Exclusive,
            )
            .await
            .unwrap();
        f.coordinator
            .create_indexes(&ctx, collection.id(), vec![IndexSpec::ascending("a_1", &["a"])])
            .await
            .unwrap();

        assert!(collection.find_index_by_name("a_1").unwrap().ready);
        // Start and commit records are written together at commit time.
        let kinds: Vec<OplogEntryKind> = f.observer.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OplogEntryKind::StartIndexBuild,
                OplogEntryKind::CommitIndexBuild
            ]
        );
        assert!(f.coordinator.verify_no_index_builds().is_ok());
    }

    #[tokio::test]
    async fn create_indexes_failure_writes_no_records() {
        let f = fixture(MemoryReplCoordinator::repl_set_member(true));
        let collection = f.catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions::default(),
        );
        collection.insert_document(json!({"a": 1}));
        collection.insert_document(json!({"a": 1}));

        let ctx = OpCtx::new();
        let _x = f
            .locks
            .lock(
                &ctx,
                LockResource::Collection(collection.id()),
                LockMode::Exclusive,
            )
            .await
            .unwrap();
        let err = f
            .coordinator
            .create_indexes(
                &ctx,
                collection.id(),
                vec![IndexSpec::ascending("a_1", &["a"]).unique()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateKey(_)));
        assert!(f.observer.entries().is_empty());
        assert!(collection.find_index_by_name("a_1").is_none());
    }

    #[tokio::test]
    async fn create_indexes_on_empty_collection_is_catalog_only() {
        let f = fixture(MemoryReplCoordinator::repl_set_member(true));
        let collection = f.catalog.create_collection(
            Namespace::new("app", "fresh"),
            CollectionOptions::default(),
        );

        let ctx = OpCtx::new();
        f.coordinator
            .create_indexes_on_empty_collection(
                &ctx,
                collection.id(),
                vec![
                    IndexSpec::ascending("a_1", &["a"]),
                    IndexSpec::ascending("b_1", &["b"]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(collection.num_indexes_total(), 2);
        assert!(collection.find_index_by_name("b_1").unwrap().ready);
        assert_eq!(f.observer.entries().len(), 2);
    }

    #[tokio::test]
    async fn default_collation_and_redundant_filtering() {
        let f = fixture(MemoryReplCoordinator::standalone());
        let collection = f.catalog.create_collection(
            Namespace::new("app", "events"),
            CollectionOptions {
                default_collation: Some("fr".into()),
                shard_key: None,
            },
        );
        collection.insert_document(json!({"a": 1}));

        let ctx = OpCtx::new();
        let build_id = BuildId::new();
        let started = f
            .coordinator
            .start_index_build(
                &ctx,
                "app",
                collection.id(),
                vec![IndexSpec::ascending("a_1", &["a"])],
                build_id,
                crate::build_state::IndexBuildProtocol::SinglePhase,
                &IndexBuildOptions::default(),
            )
            .await
            .unwrap();
        assert!(started.needs_run());

        // The registered spec picked up the collection default collation, so
        // an identical resubmission (normalized the same way) is redundant
        // even while the first build is still in progress.
        let resubmitted = f
            .coordinator
            .start_index_build(
                &ctx,
                "app",
                collection.id(),
                vec![IndexSpec::ascending("a_1", &["a"])],
                BuildId::new(),
                crate::build_state::IndexBuildProtocol::SinglePhase,
                &IndexBuildOptions::default(),
            )
            .await
            .unwrap();
        assert!(!resubmitted.needs_run());

        // Same name, different key pattern: a spec conflict, not a queue.
        let err = f
            .coordinator
            .start_index_build(
                &ctx,
                "app",
                collection.id(),
                vec![IndexSpec::ascending("a_1", &["other"])],
                BuildId::new(),
                crate::build_state::IndexBuildProtocol::SinglePhase,
                &IndexBuildOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::IndexKeySpecsConflict(_)));

        f.coordinator
            .run_index_build(&OpCtx::new(), build_id, &IndexBuildOptions::default())
            .await;
        let entry = collection.find_index_by_name("a_1").unwrap();
        assert!(entry.ready);
        assert_eq!(entry.spec.collation.as_deref(), Some("fr"));
        assert!(f.coordinator.verify_no_index_builds().is_ok());
    }
}
