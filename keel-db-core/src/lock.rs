//! Multi-granularity async lock manager.
//!
//! Resources form a hierarchy, strongest to weakest: the global lock
//! (recovery only), the replication-state latch, database locks, collection
//! locks. Modes are the classic four: intent-shared, intent-exclusive,
//! shared, exclusive.
//!
//! Acquisition is a retry loop over a version channel: a failed attempt waits
//! for the next release and retries. There is no fairness queue; the
//! coordinator's lock choreography keeps exclusive holds short enough that
//! this does not starve in practice. Waiting is interruptible through the
//! operation context, so a killed build backs out at any suspension point.
//!
//! Ordering discipline (callers' responsibility): take resources strictly
//! from stronger to weaker, and never touch this manager while holding the
//! registry or a per-record mutex.

use crate::context::OpCtx;
use crate::error::{Error, Result};
use crate::ids::CollectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lock mode.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    fn index(self) -> usize {
        match self {
            LockMode::IntentShared => 0,
            LockMode::IntentExclusive => 1,
            LockMode::Shared => 2,
            LockMode::Exclusive => 3,
        }
    }

    /// Standard multi-granularity compatibility matrix.
    pub fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match (self, held) {
            (IntentShared, IntentShared | IntentExclusive | Shared) => true,
            (IntentExclusive, IntentShared | IntentExclusive) => true,
            (Shared, IntentShared | Shared) => true,
            _ => false,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            LockMode::IntentShared => "IS",
            LockMode::IntentExclusive => "IX",
            LockMode::Shared => "S",
            LockMode::Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A lockable resource.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockResource {
    /// Whole-server lock; exclusive only during startup recovery.
    Global,
    /// Replication-state transition latch.
    ReplStateTransition,
    Database(String),
    Collection(CollectionId),
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Global => write!(f, "global"),
            LockResource::ReplStateTransition => write!(f, "rstl"),
            LockResource::Database(db) => write!(f, "db:{db}"),
            LockResource::Collection(id) => write!(f, "coll:{id}"),
        }
    }
}

type ModeCounts = [usize; 4];

fn can_grant(requested: LockMode, counts: &ModeCounts) -> bool {
    const MODES: [LockMode; 4] = [
        LockMode::IntentShared,
        LockMode::IntentExclusive,
        LockMode::Shared,
        LockMode::Exclusive,
    ];
    MODES
        .iter()
        .all(|held| counts[held.index()] == 0 || requested.compatible_with(*held))
}

#[derive(Debug)]
struct LockTable {
    table: Mutex<HashMap<LockResource, ModeCounts>>,
    version: watch::Sender<u64>,
}

impl LockTable {
    fn release(&self, resource: &LockResource, mode: LockMode) {
        {
            let mut table = self.table.lock();
            let counts = table
                .get_mut(resource)
                .expect("releasing a lock that was never granted");
            debug_assert!(counts[mode.index()] > 0);
            counts[mode.index()] -= 1;
            if counts.iter().all(|c| *c == 0) {
                table.remove(resource);
            }
        }
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// The lock manager. A cheap clonable handle; all state is shared behind it.
#[derive(Debug, Clone)]
pub struct LockManager {
    shared: Arc<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(LockTable {
                table: Mutex::new(HashMap::new()),
                version,
            }),
        }
    }

    /// Acquire `mode` on `resource`, waiting as needed. Interruptible.
    pub async fn lock(
        &self,
        ctx: &OpCtx,
        resource: LockResource,
        mode: LockMode,
    ) -> Result<LockGuard> {
        let mut rx = self.shared.version.subscribe();
        loop {
            ctx.check_for_interrupt()?;
            if let Some(guard) = self.try_lock(resource.clone(), mode) {
                return Ok(guard);
            }
            tokio::select! {
                err = ctx.interrupted() => return Err(err),
                changed = rx.changed() => {
                    changed.map_err(|_| Error::other("lock manager shut down"))?;
                }
            }
        }
    }

    /// Acquire without observing interruption. Cleanup paths use this: a
    /// build whose context is already killed must still take the exclusive
    /// lock to roll its catalog entries back.
    pub async fn lock_uninterruptible(&self, resource: LockResource, mode: LockMode) -> LockGuard {
        let mut rx = self.shared.version.subscribe();
        loop {
            if let Some(guard) = self.try_lock(resource.clone(), mode) {
                return guard;
            }
            // The sender lives on the shared table, so the channel cannot
            // close while this handle exists.
            let _ = rx.changed().await;
        }
    }

    /// Non-blocking acquisition.
    pub fn try_lock(&self, resource: LockResource, mode: LockMode) -> Option<LockGuard> {
        let mut table = self.shared.table.lock();
        let counts = table.entry(resource.clone()).or_default();
        if !can_grant(mode, counts) {
            return None;
        }
        counts[mode.index()] += 1;
        Some(LockGuard {
            shared: self.shared.clone(),
            resource,
            mode,
        })
    }

    /// True when `resource` has at least one holder in `mode`.
    pub fn is_locked(&self, resource: &LockResource, mode: LockMode) -> bool {
        self.shared
            .table
            .lock()
            .get(resource)
            .map(|counts| counts[mode.index()] > 0)
            .unwrap_or(false)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII lock hold; releases on drop.
pub struct LockGuard {
    shared: Arc<LockTable>,
    resource: LockResource,
    mode: LockMode,
}

impl LockGuard {
    pub fn resource(&self) -> &LockResource {
        &self.resource
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockGuard({} {})", self.resource, self.mode)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.shared.release(&self.resource, self.mode);
    }
}
