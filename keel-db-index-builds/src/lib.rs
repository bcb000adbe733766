//! # KeelDB Index Builds Coordinator
//!
//! The server-wide entrypoint for starting, joining, committing, and
//! aborting secondary-index builds. The coordinator mediates between three
//! otherwise independent concerns:
//!
//! - local physical index construction, consumed through the
//!   [`IndexBuildsManager`] interface;
//! - replication of build progress between primary and secondary nodes
//!   (`startIndexBuild` / `commitIndexBuild` / `abortIndexBuild` records);
//! - the catalog invariant that a collection has exactly the indexes listed
//!   in its catalog entry.
//!
//! ## Shape
//!
//! A caller submits a build through [`IndexBuildsCoordinator::start_index_build`].
//! Setup runs under the collection exclusive lock: specs are normalized,
//! redundant ones dropped, the build registered (atomically against scoped
//! blockers and the per-collection index-name rule), and the unfinished
//! catalog entries placed. The caller then drives
//! [`IndexBuildsCoordinator::run_index_build`] on a worker task; the phase
//! machine alternates lock modes over scan and drain passes, parks two-phase
//! builds on non-primaries until the replicated commit-or-abort signal, and
//! commits through the manager's write unit. Results travel through a
//! per-build promise so every joiner observes the same outcome.
//!
//! ## Concurrency
//!
//! One coarse mutex guards the registry and both tracker maps; it is held
//! for bookkeeping only. Per-record signal cells (`tokio::sync::watch`)
//! provide the wait points. The registry mutex is never held while waiting
//! on a signal cell or while touching the lock manager.

pub mod blockers;
pub mod build_state;
pub mod config;
pub mod coordinator;
mod driver;
pub mod error;
pub mod manager;
pub mod registry;
mod recovery;
mod setup;
mod signal;
mod tracker;

pub use blockers::{ScopedStopNewCollectionIndexBuilds, ScopedStopNewDatabaseIndexBuilds};
pub use build_state::{
    BuildCompletion, BuildPromise, BuildSignal, CommitQuorum, IndexBuildOptions,
    IndexBuildProtocol, IndexBuildState, IndexCatalogStats,
};
pub use config::IndexBuildsConfig;
pub use coordinator::{IndexBuildsCoordinator, StartedIndexBuild};
pub use error::{BuildError, Result};
pub use manager::{
    DrainYieldPolicy, IndexBuildsManager, IndexConstraints, LocalIndexBuildsManager, ReadSource,
    SetupOptions,
};
pub use registry::BuildRegistry;
