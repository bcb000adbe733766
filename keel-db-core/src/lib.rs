//! # KeelDB Core
//!
//! Core types shared by the KeelDB server crates:
//!
//! - Typed identifiers: `BuildId`, `CollectionId`
//! - `Timestamp` and the node-local `LogicalClock`
//! - Index specifications and their normalization rules
//! - The in-memory collection catalog (collections, documents, index entries)
//! - A multi-granularity async lock manager (`IS`/`IX`/`S`/`X`)
//! - `OpCtx`: per-operation interruption and write-timestamp context
//!
//! ## Design Principles
//!
//! 1. **Coordinate by id, not by name**: collections are addressed by
//!    `CollectionId`, which is stable across rename. Namespace strings are
//!    display/lookup conveniences only.
//! 2. **Short critical sections**: every `parking_lot` lock in this crate is
//!    held for bookkeeping only, never across `.await`.
//! 3. **Interruption is cooperative**: blocking waits go through `OpCtx` so a
//!    kill or shutdown flag is observed at every suspension point.

pub mod catalog;
pub mod context;
pub mod error;
pub mod ids;
pub mod index_spec;
pub mod lock;
pub mod namespace;
pub mod timestamp;

pub use catalog::{Collection, CollectionCatalog, CollectionOptions, Document, IndexCatalogEntry};
pub use context::{InterruptKind, OpCtx, RestrictedInterruptGuard, TimestampBlock};
pub use error::{Error, Result};
pub use ids::{BuildId, CollectionId};
pub use index_spec::{IndexKey, IndexSpec, KeyDirection};
pub use lock::{LockGuard, LockManager, LockMode, LockResource};
pub use namespace::Namespace;
pub use timestamp::{LogicalClock, Timestamp};
