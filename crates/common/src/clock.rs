//! Wall-clock abstraction.
//!
//! Every component that compares timestamps (connection age, rate limit
//! windows, record expiry) reads time through [`Clock`] so that boundary
//! conditions can be tested without wall-clock dependence.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time as Unix epoch milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Current time in epoch seconds (floor).
    fn now_secs(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Cloning shares the underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    #[must_use]
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Move the clock forward by `millis`.
    pub fn advance_ms(&self, millis: i64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move the clock forward by whole minutes.
    pub fn advance_minutes(&self, minutes: i64) {
        self.advance_ms(minutes * 60_000);
    }

    /// Set the clock to an absolute time.
    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_shared_state() {
        let clock = ManualClock::new(1_700_000_000_000);
        let shared = clock.clone();

        clock.advance_minutes(2);

        assert_eq!(shared.now_ms(), 1_700_000_120_000);
        assert_eq!(shared.now_secs(), 1_700_000_120);
    }

    #[test]
    fn test_now_secs_floors() {
        let clock = ManualClock::new(1_999);
        assert_eq!(clock.now_secs(), 1);
        clock.set_ms(-1);
        assert_eq!(clock.now_secs(), -1);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2023-11-14 as a sanity floor
        assert!(SystemClock.now_ms() > 1_700_000_000_000);
    }
}
