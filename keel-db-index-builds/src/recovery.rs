//! Startup recovery: rebuild unfinished indexes under the global exclusive
//! lock.
//!
//! Recovery runs before the server accepts operations, so the build is
//! single-phase and foreground: drop whatever entries exist for the specs
//! (including unfinished ones that never reached ready), place fresh
//! unfinished entries, scan, check constraints, commit. A failure here means
//! the catalog cannot be made consistent and the process halts.

use crate::build_state::{IndexBuildProtocol, IndexBuildState};
use crate::coordinator::IndexBuildsCoordinator;
use crate::error::{fatal_invariant, BuildError, Result};
use crate::manager::{IndexConstraints, SetupOptions};
use keel_db_core::{BuildId, Collection, IndexSpec, LockMode, LockResource, Namespace, OpCtx};
use std::sync::Arc;
use tracing::info;

impl IndexBuildsCoordinator {
    /// Rebuild `specs` on `namespace` during startup. Returns the number of
    /// records and the size of the data scanned.
    pub async fn start_index_rebuild_for_recovery(
        &self,
        ctx: &OpCtx,
        namespace: &Namespace,
        specs: Vec<IndexSpec>,
        build_id: BuildId,
    ) -> Result<(u64, u64)> {
        // Recovery owns the server: everything happens under the global
        // exclusive lock.
        let _global = self
            .locks()
            .lock(ctx, LockResource::Global, LockMode::Exclusive)
            .await?;

        for spec in &specs {
            if spec.name.is_empty() {
                return Err(BuildError::CannotCreateIndex(format!(
                    "cannot rebuild an index from a spec without a name: {spec:?}"
                )));
            }
        }

        let collection = self
            .catalog()
            .lookup_by_namespace(namespace)
            .ok_or_else(|| BuildError::NamespaceNotFound(namespace.to_string()))?;

        // Drop the existing entries, ready or unfinished; the rebuild
        // recreates all of them.
        for spec in &specs {
            collection.remove_index(&spec.name);
        }

        let record = IndexBuildState::new(
            build_id,
            collection.id(),
            namespace.db(),
            specs.clone(),
            IndexBuildProtocol::SinglePhase,
            None,
        );
        // The dropped entries come back, so the before-count includes them.
        record.set_num_indexes_before(collection.num_indexes_total() + specs.len());
        self.registry().register(record.clone())?;

        let setup_options = SetupOptions {
            constraints: IndexConstraints::Enforce,
            protocol: IndexBuildProtocol::SinglePhase,
            for_recovery: true,
        };
        if let Err(err) = self
            .manager()
            .set_up_index_build(
                ctx,
                &collection,
                &specs,
                build_id,
                setup_options,
                &|_specs: &[IndexSpec]| Ok(()),
            )
            .await
        {
            fatal_invariant("index build setup failed during startup recovery", &err);
        }

        self.run_index_rebuild_for_recovery(ctx, &collection, &record)
            .await
    }

    async fn run_index_rebuild_for_recovery(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        record: &Arc<IndexBuildState>,
    ) -> Result<(u64, u64)> {
        let namespace = collection.namespace();
        info!(
            build_id = %record.build_id,
            namespace = %namespace,
            indexes = record.specs.len(),
            "startup index rebuild starting"
        );

        let build_id = record.build_id;
        let result: Result<(u64, u64)> = async {
            let (num_records, data_size) = self
                .manager()
                .start_building_index_for_recovery(ctx, &namespace, build_id)
                .await?;
            self.manager()
                .check_index_constraint_violations(ctx, build_id)
                .await?;
            self.manager()
                .commit_index_build(ctx, collection, build_id, &|_spec| {}, &|_ts| {})
                .await?;
            Ok((num_records, data_size))
        }
        .await;

        let (num_records, data_size) = match result {
            Ok(counts) => counts,
            // The catalog is inconsistent; there is nothing to fall back to.
            Err(err) => fatal_invariant("index rebuild failed during startup recovery", &err),
        };

        record.set_num_indexes_after(collection.num_indexes_total());
        let _ = self
            .manager()
            .tear_down_index_build(ctx, collection, build_id, &|| {})
            .await;

        let stats = record.stats();
        info!(
            build_id = %build_id,
            namespace = %namespace,
            num_records,
            data_size,
            num_indexes_before = stats.num_indexes_before,
            num_indexes_after = stats.num_indexes_after,
            "startup index rebuild completed successfully"
        );
        // Every dropped entry was rebuilt, so the counts must agree.
        debug_assert_eq!(stats.num_indexes_before, stats.num_indexes_after);

        self.registry().unregister(record);
        record.fulfill(Ok(stats));
        Ok((num_records, data_size))
    }
}
