//! Commit timestamps and the node-local logical clock.
//!
//! A `Timestamp` orders catalog writes. The zero value is the *null*
//! timestamp: "no external timestamp available". Replicated log entries carry
//! nonzero timestamps assigned by the primary; a node writing locally (a
//! primary, a standalone, or a recovery pass) draws a *ghost* timestamp from
//! its `LogicalClock` instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical commit timestamp. Zero means "null / unset".
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The null timestamp.
    pub const NULL: Timestamp = Timestamp(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Timestamp(null)")
        } else {
            write!(f, "Timestamp({})", self.0)
        }
    }
}

/// Monotonic source of ghost timestamps for local catalog writes.
///
/// Starts at 1 so the first draw is never the null timestamp.
#[derive(Debug)]
pub struct LogicalClock {
    next: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Draw the next timestamp.
    pub fn tick(&self) -> Timestamp {
        Timestamp(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Advance the clock past an externally observed timestamp so later local
    /// draws sort after it.
    pub fn observe(&self, ts: Timestamp) {
        if ts.is_null() {
            return;
        }
        let mut current = self.next.load(Ordering::Relaxed);
        while current <= ts.0 {
            match self.next.compare_exchange_weak(
                current,
                ts.0 + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_timestamp_is_zero() {
        assert!(Timestamp::NULL.is_null());
        assert!(!Timestamp(1).is_null());
        assert!(Timestamp(1) < Timestamp(2));
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = LogicalClock::new();
        let a = clock.tick();
        let b = clock.tick();
        assert!(!a.is_null());
        assert!(a < b);
    }

    #[test]
    fn clock_observe_advances_past_external() {
        let clock = LogicalClock::new();
        clock.observe(Timestamp(100));
        assert!(clock.tick() > Timestamp(100));
        // Observing something older is a no-op.
        clock.observe(Timestamp(5));
        assert!(clock.tick() > Timestamp(100));
    }
}
