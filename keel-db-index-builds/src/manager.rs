//! The `IndexBuildsManager` interface and the local builder behind it.
//!
//! The coordinator consumes the manager through this trait; the manager owns
//! the low-level mechanics of a build (scanning, key extraction, side-write
//! drains, constraint checks, catalog commit/teardown) and serializes
//! per-build state under its own lock. The commit and cleanup callbacks run
//! inside the manager's write unit and must never touch the coordinator's
//! registry mutex.
//!
//! [`LocalIndexBuildsManager`] is the in-process implementation over the
//! in-memory catalog. Writes that land on a collection while a build is in
//! flight are fed to the build's side table via [`LocalIndexBuildsManager::
//! enqueue_side_write`]; the drain passes apply them in arrival order.

use crate::build_state::IndexBuildProtocol;
use crate::error::{BuildError, Result};
use async_trait::async_trait;
use keel_db_core::{
    BuildId, Collection, CollectionCatalog, CollectionId, IndexSpec, Namespace, OpCtx, Timestamp,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Whether constraint violations fail the build or are deferred.
///
/// A node applying replicated writes relaxes constraints: it must not fail a
/// build the primary already validated.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IndexConstraints {
    Enforce,
    Relax,
}

/// Snapshot source for a drain pass.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReadSource {
    Unset,
    MajorityCommitted,
}

/// Whether a drain pass may yield between batches.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DrainYieldPolicy {
    Yield,
    NoYield,
}

/// Options for `set_up_index_build`.
#[derive(Copy, Clone, Debug)]
pub struct SetupOptions {
    pub constraints: IndexConstraints,
    pub protocol: IndexBuildProtocol,
    pub for_recovery: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            constraints: IndexConstraints::Enforce,
            protocol: IndexBuildProtocol::SinglePhase,
            for_recovery: false,
        }
    }
}

/// Callback invoked inside setup's write unit, after the unfinished entries
/// are placed. Writes the `startIndexBuild` record on a primary.
pub type OnInitFn<'a> = &'a (dyn Fn(&[IndexSpec]) -> Result<()> + Send + Sync);

/// Callback invoked for each spec inside the commit write unit.
pub type OnEachSpecFn<'a> = &'a (dyn Fn(&IndexSpec) + Send + Sync);

/// Callback invoked once inside the commit write unit with the timestamp the
/// catalog entries were committed at.
pub type OnCommitFn<'a> = &'a (dyn Fn(Timestamp) + Send + Sync);

/// Callback invoked inside teardown's write unit when the build did not
/// commit. Writes the `abortIndexBuild` record on a primary.
pub type OnCleanUpFn<'a> = &'a (dyn Fn() + Send + Sync);

/// The low-level index builder, as consumed by the coordinator.
#[async_trait]
pub trait IndexBuildsManager: Send + Sync + std::fmt::Debug {
    /// Place the indexes in the catalog in an unfinished state and prepare
    /// the builder.
    async fn set_up_index_build(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        specs: &[IndexSpec],
        build_id: BuildId,
        options: SetupOptions,
        on_init: OnInitFn<'_>,
    ) -> Result<()>;

    /// Collection scan and bulk key insertion.
    async fn start_building_index(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
    ) -> Result<()>;

    /// Recovery variant: scans under the global exclusive lock and reports
    /// (record count, data size).
    async fn start_building_index_for_recovery(
        &self,
        ctx: &OpCtx,
        namespace: &Namespace,
        build_id: BuildId,
    ) -> Result<(u64, u64)>;

    /// Apply writes accumulated in the side table.
    async fn drain_background_writes(
        &self,
        ctx: &OpCtx,
        build_id: BuildId,
        read_source: ReadSource,
        yield_policy: DrainYieldPolicy,
    ) -> Result<()>;

    /// Fail with `DuplicateKey` if a unique spec has conflicting keys.
    async fn check_index_constraint_violations(&self, ctx: &OpCtx, build_id: BuildId)
        -> Result<()>;

    /// Flip the catalog entries to ready inside one write unit. The commit
    /// timestamp comes from the operation context; a null context timestamp
    /// draws a ghost timestamp from the catalog clock.
    async fn commit_index_build(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
        on_each_spec: OnEachSpecFn<'_>,
        on_commit: OnCommitFn<'_>,
    ) -> Result<()>;

    /// Release builder state. Uncommitted, uninterrupted builds roll their
    /// unfinished catalog entries back; interrupted builds leave them for
    /// startup recovery.
    async fn tear_down_index_build(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
        on_clean_up: OnCleanUpFn<'_>,
    ) -> Result<()>;

    /// Signal abort to a builder. Returns false when the builder is not
    /// registered here (the caller then signals the coordinator record).
    fn abort_index_build(&self, build_id: BuildId, reason: &str) -> bool;

    /// Shutdown interruption: leave the build as-if the process died, so the
    /// next startup recovers it.
    fn interrupt_index_build(&self, build_id: BuildId, reason: &str);

    fn is_background_building(&self, build_id: BuildId) -> bool;
}

// ---------------------------------------------------------------------------
// LocalIndexBuildsManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManagedBuildState {
    /// Extracted keys per index name, encoded for comparison.
    keys: HashMap<String, Vec<String>>,
    side_writes: VecDeque<serde_json::Value>,
    aborted: Option<String>,
    interrupted: Option<String>,
    committed: bool,
}

#[derive(Debug)]
struct ManagedBuild {
    collection_id: CollectionId,
    specs: Vec<IndexSpec>,
    state: Mutex<ManagedBuildState>,
}

impl ManagedBuild {
    /// Abort and shutdown flags fail the next builder operation.
    fn check_signals(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return Err(BuildError::IndexBuildAborted(reason.clone()));
        }
        if let Some(reason) = &state.interrupted {
            return Err(BuildError::InterruptedAtShutdown(reason.clone()));
        }
        Ok(())
    }

    fn ingest(&self, state: &mut ManagedBuildState, document: &serde_json::Value) {
        for spec in &self.specs {
            let key = encode_key(spec, document);
            state.keys.entry(spec.name.clone()).or_default().push(key);
        }
    }
}

/// Extract and encode the key a document contributes to an index. Missing
/// fields key as JSON null, matching the sparse-less default.
fn encode_key(spec: &IndexSpec, document: &serde_json::Value) -> String {
    let values: Vec<&serde_json::Value> = spec
        .keys
        .iter()
        .map(|k| document.get(&k.field).unwrap_or(&serde_json::Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// In-process builder over the in-memory catalog.
#[derive(Debug)]
pub struct LocalIndexBuildsManager {
    catalog: Arc<CollectionCatalog>,
    builds: Mutex<HashMap<BuildId, Arc<ManagedBuild>>>,
}

impl LocalIndexBuildsManager {
    pub fn new(catalog: Arc<CollectionCatalog>) -> Self {
        Self {
            catalog,
            builds: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, build_id: BuildId) -> Result<Arc<ManagedBuild>> {
        self.builds
            .lock()
            .get(&build_id)
            .cloned()
            .ok_or(BuildError::NoSuchBuild(build_id))
    }

    /// Write-path interception: a write landing on the collection while the
    /// build is in flight is queued here and applied by the drain passes.
    pub fn enqueue_side_write(&self, build_id: BuildId, document: serde_json::Value) -> Result<()> {
        let build = self.get(build_id)?;
        build.state.lock().side_writes.push_back(document);
        Ok(())
    }

    /// Number of queued, not-yet-drained side writes. Test surface.
    pub fn pending_side_writes(&self, build_id: BuildId) -> usize {
        self.get(build_id)
            .map(|b| b.state.lock().side_writes.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IndexBuildsManager for LocalIndexBuildsManager {
    async fn set_up_index_build(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        specs: &[IndexSpec],
        build_id: BuildId,
        options: SetupOptions,
        on_init: OnInitFn<'_>,
    ) -> Result<()> {
        ctx.check_for_interrupt()?;

        // One write unit: place every entry, then run the init hook. Any
        // failure rolls the placed entries back.
        let mut placed: Vec<&str> = Vec::new();
        let result: Result<()> = (|| {
            for spec in specs {
                collection.add_unfinished_index(spec.clone(), build_id)?;
                placed.push(&spec.name);
            }
            on_init(specs)
        })();
        if let Err(err) = result {
            for name in placed {
                collection.remove_index(name);
            }
            return Err(err);
        }

        let build = Arc::new(ManagedBuild {
            collection_id: collection.id(),
            specs: specs.to_vec(),
            state: Mutex::new(ManagedBuildState::default()),
        });
        let previous = self.builds.lock().insert(build_id, build);
        debug_assert!(previous.is_none(), "manager already tracks build {build_id}");
        debug!(
            build_id = %build_id,
            collection_id = %collection.id(),
            specs = specs.len(),
            for_recovery = options.for_recovery,
            constraints = ?options.constraints,
            "index build set up"
        );
        Ok(())
    }

    async fn start_building_index(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
    ) -> Result<()> {
        ctx.check_for_interrupt()?;
        let build = self.get(build_id)?;
        build.check_signals()?;
        debug_assert_eq!(build.collection_id, collection.id());

        let documents = collection.scan();
        let mut state = build.state.lock();
        for doc in &documents {
            build.ingest(&mut state, &doc.body);
        }
        debug!(build_id = %build_id, records = documents.len(), "collection scan complete");
        Ok(())
    }

    async fn start_building_index_for_recovery(
        &self,
        ctx: &OpCtx,
        namespace: &Namespace,
        build_id: BuildId,
    ) -> Result<(u64, u64)> {
        ctx.check_for_interrupt()?;
        let collection = self
            .catalog
            .lookup_by_namespace(namespace)
            .ok_or_else(|| BuildError::NamespaceNotFound(namespace.to_string()))?;
        let build = self.get(build_id)?;

        let documents = collection.scan();
        let mut data_size = 0u64;
        let mut state = build.state.lock();
        for doc in &documents {
            data_size += doc.body.to_string().len() as u64;
            build.ingest(&mut state, &doc.body);
        }
        Ok((documents.len() as u64, data_size))
    }

    async fn drain_background_writes(
        &self,
        ctx: &OpCtx,
        build_id: BuildId,
        _read_source: ReadSource,
        yield_policy: DrainYieldPolicy,
    ) -> Result<()> {
        ctx.check_for_interrupt()?;
        let build = self.get(build_id)?;
        build.check_signals()?;

        let mut drained = 0usize;
        loop {
            let batch: Vec<serde_json::Value> = {
                let mut state = build.state.lock();
                state.side_writes.drain(..).collect()
            };
            if batch.is_empty() {
                break;
            }
            drained += batch.len();
            {
                let mut state = build.state.lock();
                for doc in &batch {
                    build.ingest(&mut state, doc);
                }
            }
            if yield_policy == DrainYieldPolicy::Yield {
                // Writers may refill the side table while we yield; loop
                // until it reads empty.
                tokio::task::yield_now().await;
                ctx.check_for_interrupt()?;
            }
        }
        debug!(build_id = %build_id, drained, "side writes drained");
        Ok(())
    }

    async fn check_index_constraint_violations(
        &self,
        ctx: &OpCtx,
        build_id: BuildId,
    ) -> Result<()> {
        ctx.check_for_interrupt()?;
        let build = self.get(build_id)?;
        build.check_signals()?;

        let state = build.state.lock();
        for spec in &build.specs {
            if !spec.unique {
                continue;
            }
            if let Some(keys) = state.keys.get(&spec.name) {
                let mut seen = std::collections::HashSet::with_capacity(keys.len());
                for key in keys {
                    if !seen.insert(key.as_str()) {
                        return Err(BuildError::DuplicateKey(format!(
                            "unique index '{}' has duplicate key {key}",
                            spec.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn commit_index_build(
        &self,
        ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
        on_each_spec: OnEachSpecFn<'_>,
        on_commit: OnCommitFn<'_>,
    ) -> Result<()> {
        let build = self.get(build_id)?;
        build.check_signals()?;

        // Use the context's timestamp when one is installed (replicated
        // commit); draw a ghost timestamp otherwise.
        let ts = match ctx.commit_timestamp() {
            ts if ts.is_null() => self.catalog.next_timestamp(),
            ts => {
                self.catalog.observe_timestamp(ts);
                ts
            }
        };

        for spec in &build.specs {
            on_each_spec(spec);
            collection.mark_index_ready(&spec.name, ts)?;
        }
        build.state.lock().committed = true;
        on_commit(ts);
        debug!(build_id = %build_id, timestamp = %ts, "index build committed in catalog");
        Ok(())
    }

    async fn tear_down_index_build(
        &self,
        _ctx: &OpCtx,
        collection: &Arc<Collection>,
        build_id: BuildId,
        on_clean_up: OnCleanUpFn<'_>,
    ) -> Result<()> {
        let Some(build) = self.builds.lock().remove(&build_id) else {
            return Ok(());
        };
        let state = build.state.lock();
        if !state.committed {
            on_clean_up();
            if state.interrupted.is_none() {
                let removed = collection.remove_unfinished_indexes(build_id);
                debug!(build_id = %build_id, removed = removed.len(), "unfinished index entries rolled back");
            } else {
                // Interrupted at shutdown: leave the unfinished entries so
                // the next startup can resume the build.
                debug!(build_id = %build_id, "leaving unfinished entries for startup recovery");
            }
        }
        Ok(())
    }

    fn abort_index_build(&self, build_id: BuildId, reason: &str) -> bool {
        match self.builds.lock().get(&build_id) {
            Some(build) => {
                let mut state = build.state.lock();
                if state.aborted.is_none() {
                    state.aborted = Some(reason.to_owned());
                }
                true
            }
            None => false,
        }
    }

    fn interrupt_index_build(&self, build_id: BuildId, reason: &str) {
        if let Some(build) = self.builds.lock().get(&build_id) {
            let mut state = build.state.lock();
            if state.interrupted.is_none() {
                state.interrupted = Some(reason.to_owned());
            }
        }
    }

    fn is_background_building(&self, build_id: BuildId) -> bool {
        self.builds.lock().contains_key(&build_id)
    }
}
