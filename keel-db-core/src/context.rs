//! Per-operation context: interruption, write timestamps, held latches.
//!
//! Every long-running operation carries an `OpCtx`. Interruption is a flag on
//! the context, polled at suspension points via `check_for_interrupt` and
//! awaitable via `interrupted` for select-based waits.
//!
//! ## Restricted interruption
//!
//! `run_uninterruptible_except_shutdown` opens a scoped region in which only
//! the process-shutdown kill is observable. The region is reentrant: nested
//! guards stack a depth counter. Index builds driven by replicated log
//! application run their entire phase machine inside such a region, because
//! locally aborting a build the primary will commit would diverge the node.
//!
//! ## Write timestamps
//!
//! Catalog writes read their commit timestamp from the context. The
//! replication layer installs the log entry's timestamp with a
//! `TimestampBlock` before applying an entry; local writers leave it null and
//! draw a ghost timestamp from the catalog clock instead.

use crate::error::{Error, Result};
use crate::lock::LockGuard;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Why an operation was killed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum InterruptKind {
    /// Killed by a user or a conflicting operation.
    Kill,
    /// Killed by process shutdown. Observable even in restricted regions.
    Shutdown,
}

#[derive(Clone, Debug)]
struct CtxState {
    kill: Option<InterruptKind>,
    restricted_depth: u32,
}

impl CtxState {
    fn effective_kill(&self) -> Option<InterruptKind> {
        match self.kill {
            Some(InterruptKind::Shutdown) => Some(InterruptKind::Shutdown),
            Some(InterruptKind::Kill) if self.restricted_depth == 0 => Some(InterruptKind::Kill),
            _ => None,
        }
    }
}

/// Operation context.
#[derive(Debug)]
pub struct OpCtx {
    state: watch::Sender<CtxState>,
    write_ts: Mutex<Timestamp>,
    /// Replication-state latch held on behalf of this operation, if any.
    rstl: Mutex<Option<LockGuard>>,
}

impl OpCtx {
    pub fn new() -> Self {
        let (state, _) = watch::channel(CtxState {
            kill: None,
            restricted_depth: 0,
        });
        Self {
            state,
            write_ts: Mutex::new(Timestamp::NULL),
            rstl: Mutex::new(None),
        }
    }

    /// Mark the operation killed. The first kind sticks; a later `Shutdown`
    /// upgrades a plain kill (shutdown must stay observable everywhere).
    pub fn kill(&self, kind: InterruptKind) {
        self.state.send_modify(|s| match (s.kill, kind) {
            (None, k) => s.kill = Some(k),
            (Some(InterruptKind::Kill), InterruptKind::Shutdown) => {
                s.kill = Some(InterruptKind::Shutdown)
            }
            _ => {}
        });
    }

    /// Error out if an observable kill flag is set.
    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.state.borrow().effective_kill() {
            None => Ok(()),
            Some(kind) => Err(interrupt_error(kind)),
        }
    }

    /// Resolve once an observable kill flag is set, yielding the matching
    /// error. Intended for `tokio::select!` against a wait.
    pub async fn interrupted(&self) -> Error {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(|s| s.effective_kill().is_some()).await {
            Ok(state) => interrupt_error(state.effective_kill().expect("guarded by wait_for")),
            // The sender lives as long as `self`, so this is unreachable; be
            // conservative and report shutdown.
            Err(_) => interrupt_error(InterruptKind::Shutdown),
        };
        result
    }

    /// Enter a region where only the shutdown kill is observable.
    pub fn run_uninterruptible_except_shutdown(&self) -> RestrictedInterruptGuard<'_> {
        self.state.send_modify(|s| s.restricted_depth += 1);
        RestrictedInterruptGuard { ctx: self }
    }

    // -- write timestamps ---------------------------------------------------

    /// Commit timestamp installed for the current write, null if none.
    pub fn commit_timestamp(&self) -> Timestamp {
        *self.write_ts.lock()
    }

    // -- replication-state latch --------------------------------------------

    /// Record that this operation holds the replication-state latch.
    pub fn set_rstl_guard(&self, guard: LockGuard) {
        *self.rstl.lock() = Some(guard);
    }

    /// Drop the held replication-state latch, if any. Index-build cleanup
    /// must do this before reacquiring the exclusive collection lock, or a
    /// step-down waiting on the latch deadlocks against a prepared
    /// transaction holding a collection intent lock.
    pub fn release_rstl_for_cleanup(&self) -> bool {
        self.rstl.lock().take().is_some()
    }

    pub fn holds_rstl(&self) -> bool {
        self.rstl.lock().is_some()
    }
}

impl Default for OpCtx {
    fn default() -> Self {
        Self::new()
    }
}

fn interrupt_error(kind: InterruptKind) -> Error {
    match kind {
        InterruptKind::Kill => Error::Interrupted("operation was interrupted".into()),
        InterruptKind::Shutdown => {
            Error::InterruptedAtShutdown("operation was interrupted at shutdown".into())
        }
    }
}

/// RAII guard for a restricted-interruption region.
pub struct RestrictedInterruptGuard<'a> {
    ctx: &'a OpCtx,
}

impl Drop for RestrictedInterruptGuard<'_> {
    fn drop(&mut self) {
        self.ctx.state.send_modify(|s| {
            debug_assert!(s.restricted_depth > 0);
            s.restricted_depth = s.restricted_depth.saturating_sub(1);
        });
    }
}

/// RAII block that installs a commit timestamp on the context for the
/// duration of a catalog write. A null timestamp makes the block a no-op.
pub struct TimestampBlock<'a> {
    ctx: &'a OpCtx,
    prev: Timestamp,
    active: bool,
}

impl<'a> TimestampBlock<'a> {
    pub fn new(ctx: &'a OpCtx, ts: Timestamp) -> Self {
        if ts.is_null() {
            return Self {
                ctx,
                prev: Timestamp::NULL,
                active: false,
            };
        }
        let prev = {
            let mut slot = ctx.write_ts.lock();
            std::mem::replace(&mut *slot, ts)
        };
        Self {
            ctx,
            prev,
            active: true,
        }
    }
}

impl Drop for TimestampBlock<'_> {
    fn drop(&mut self) {
        if self.active {
            *self.ctx.write_ts.lock() = self.prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_kill_observed() {
        let ctx = OpCtx::new();
        assert!(ctx.check_for_interrupt().is_ok());
        ctx.kill(InterruptKind::Kill);
        assert!(matches!(
            ctx.check_for_interrupt(),
            Err(Error::Interrupted(_))
        ));
    }

    #[test]
    fn restricted_region_masks_kill_but_not_shutdown() {
        let ctx = OpCtx::new();
        ctx.kill(InterruptKind::Kill);
        {
            let _outer = ctx.run_uninterruptible_except_shutdown();
            assert!(ctx.check_for_interrupt().is_ok());
            {
                // Nested guard stacks.
                let _inner = ctx.run_uninterruptible_except_shutdown();
                assert!(ctx.check_for_interrupt().is_ok());
            }
            assert!(ctx.check_for_interrupt().is_ok());

            ctx.kill(InterruptKind::Shutdown);
            assert!(matches!(
                ctx.check_for_interrupt(),
                Err(Error::InterruptedAtShutdown(_))
            ));
        }
        assert!(matches!(
            ctx.check_for_interrupt(),
            Err(Error::InterruptedAtShutdown(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_resolves_on_kill() {
        let ctx = std::sync::Arc::new(OpCtx::new());
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.interrupted().await })
        };
        ctx.kill(InterruptKind::Kill);
        let err = waiter.await.unwrap();
        assert!(matches!(err, Error::Interrupted(_)));
    }

    #[test]
    fn timestamp_block_installs_and_restores() {
        let ctx = OpCtx::new();
        assert!(ctx.commit_timestamp().is_null());
        {
            let _block = TimestampBlock::new(&ctx, Timestamp(42));
            assert_eq!(ctx.commit_timestamp(), Timestamp(42));
            {
                let _nested = TimestampBlock::new(&ctx, Timestamp(43));
                assert_eq!(ctx.commit_timestamp(), Timestamp(43));
            }
            assert_eq!(ctx.commit_timestamp(), Timestamp(42));
        }
        assert!(ctx.commit_timestamp().is_null());

        // Null timestamp: no-op block.
        let _block = TimestampBlock::new(&ctx, Timestamp::NULL);
        assert!(ctx.commit_timestamp().is_null());
    }
}
