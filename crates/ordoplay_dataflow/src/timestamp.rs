// SPDX-License-Identifier: MIT OR Apache-2.0
//! Logical clock used to decide cache staleness.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide clock. Starts at 1 so that `Timestamp::INVALID` is never handed out.
static CLOCK: AtomicU64 = AtomicU64::new(1);

/// Monotonic logical timestamp.
///
/// Every call to [`Timestamp::now`] returns a value strictly greater than any
/// previously returned value, so an invalidation followed by an evaluation
/// always orders correctly even when both happen within the same tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The "never" timestamp. Any existing cache entry is at least this new.
    pub const INVALID: Self = Self(0);

    /// Advance the clock and return the new value
    pub fn now() -> Self {
        Self(CLOCK.fetch_add(1, Ordering::Relaxed))
    }

    /// Move the clock past `timestamp`, used when restoring persisted entries
    pub fn observe(timestamp: Self) {
        CLOCK.fetch_max(timestamp.0.saturating_add(1), Ordering::Relaxed);
    }

    /// Whether this timestamp was produced by the clock
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Raw value
    pub fn value(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_strictly_increasing() {
        let first = Timestamp::now();
        let second = Timestamp::now();
        assert!(second > first);
        assert!(first.is_valid());
        assert!(!Timestamp::INVALID.is_valid());
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let far = Timestamp(Timestamp::now().0 + 1_000);
        Timestamp::observe(far);
        assert!(Timestamp::now() > far);
    }
}
