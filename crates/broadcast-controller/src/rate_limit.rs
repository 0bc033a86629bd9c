//! Fixed-window rate limiting backed by durable counters.
//!
//! Each `(operation, identifier)` pair owns one counter record holding
//! `count` and `windowStart`. A consume is one atomic store call that either
//! opens a new window or increments the open one. Calls over the limit are
//! rejected but stay counted, so a client hammering a closed window keeps
//! getting rejected until the window rolls over.
//!
//! The limiter fails open: if the store cannot be reached the request is
//! allowed and a warning is logged.

use crate::errors::BroadcastError;
use crate::observability::metrics;
use crate::store::{int_field, keys, StateStore};
use common::clock::Clock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Limit and window for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub const fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub session_create: RateLimitRule,
    pub listener_join: RateLimitRule,
    pub connection_attempt: RateLimitRule,
    pub heartbeat: RateLimitRule,
    pub audio_chunk: RateLimitRule,
    /// Extra lifetime on counter records past the end of their window.
    pub safety_buffer_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            session_create: RateLimitRule::new(50, 3600),
            listener_join: RateLimitRule::new(10, 60),
            connection_attempt: RateLimitRule::new(20, 60),
            heartbeat: RateLimitRule::new(2, 60),
            audio_chunk: RateLimitRule::new(600, 60),
            safety_buffer_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn rule(&self, operation: Operation) -> RateLimitRule {
        match operation {
            Operation::SessionCreate => self.session_create,
            Operation::ListenerJoin => self.listener_join,
            Operation::ConnectionAttempt => self.connection_attempt,
            Operation::Heartbeat => self.heartbeat,
            Operation::AudioChunk => self.audio_chunk,
        }
    }
}

/// Rate limited operations. Each is keyed by a fixed identifier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SessionCreate,
    ListenerJoin,
    ConnectionAttempt,
    Heartbeat,
    AudioChunk,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::SessionCreate => "sessionCreate",
            Operation::ListenerJoin => "listenerJoin",
            Operation::ConnectionAttempt => "connectionAttempt",
            Operation::Heartbeat => "heartbeat",
            Operation::AudioChunk => "audioChunk",
        }
    }

    pub const fn identifier_type(self) -> &'static str {
        match self {
            Operation::SessionCreate => "user",
            Operation::ListenerJoin | Operation::ConnectionAttempt => "ip",
            Operation::Heartbeat | Operation::AudioChunk => "connection",
        }
    }
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub count: i64,
    pub limit: u32,
    /// Seconds until the open window closes; 0 when no window is open.
    pub reset_in_seconds: u64,
}

/// Seconds until a window starting at `window_start_ms` closes, rounded up.
fn seconds_until_reset(window_start_ms: i64, window_ms: i64, now_ms: i64) -> u64 {
    let remaining_ms = window_start_ms
        .saturating_add(window_ms)
        .saturating_sub(now_ms);
    if remaining_ms <= 0 {
        return 0;
    }
    u64::try_from((remaining_ms + 999) / 1000).unwrap_or(u64::MAX)
}

pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Count one call against `(operation, identifier)`.
    ///
    /// # Errors
    ///
    /// `BroadcastError::RateLimitExceeded` when the count passes the limit.
    /// Store failures never surface; the call is allowed.
    pub async fn check_and_consume(
        &self,
        operation: Operation,
        identifier: &str,
    ) -> Result<(), BroadcastError> {
        let rule = self.config.rule(operation);
        let key = keys::rate_limit(operation.as_str(), operation.identifier_type(), identifier);
        let now_ms = self.clock.now_ms();
        let window_ms = rule.window_ms();
        let window_end_secs = now_ms.saturating_add(window_ms).div_euclid(1000);
        let safety = i64::try_from(self.config.safety_buffer_seconds).unwrap_or(i64::MAX);
        let expires_at_secs = window_end_secs.saturating_add(safety);

        let window = match self
            .store
            .consume_window(&key, now_ms, window_ms, expires_at_secs)
            .await
        {
            Ok(window) => window,
            Err(e) => {
                warn!(
                    target: "bc.rate_limit",
                    operation = operation.as_str(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                metrics::record_rate_limit_decision(operation.as_str(), "fail_open");
                return Ok(());
            }
        };

        if window.count > i64::from(rule.limit) {
            let retry_after_seconds =
                seconds_until_reset(window.window_start_ms, window_ms, now_ms).max(1);
            debug!(
                target: "bc.rate_limit",
                operation = operation.as_str(),
                count = window.count,
                limit = rule.limit,
                retry_after_seconds = retry_after_seconds,
                "Rate limit exceeded"
            );
            metrics::record_rate_limit_decision(operation.as_str(), "rejected");
            return Err(BroadcastError::RateLimitExceeded {
                operation: operation.as_str(),
                retry_after_seconds,
            });
        }

        metrics::record_rate_limit_decision(operation.as_str(), "allowed");
        Ok(())
    }

    /// Current counter state without consuming.
    pub async fn status(
        &self,
        operation: Operation,
        identifier: &str,
    ) -> Result<RateLimitStatus, BroadcastError> {
        let rule = self.config.rule(operation);
        let key = keys::rate_limit(operation.as_str(), operation.identifier_type(), identifier);
        let now_ms = self.clock.now_ms();

        let idle = RateLimitStatus {
            count: 0,
            limit: rule.limit,
            reset_in_seconds: 0,
        };
        let Some(record) = self.store.get(&key).await? else {
            return Ok(idle);
        };
        let Some(window_start_ms) = int_field(&record, "windowStart")? else {
            return Ok(idle);
        };
        let reset_in_seconds = seconds_until_reset(window_start_ms, rule.window_ms(), now_ms);
        if reset_in_seconds == 0 {
            return Ok(idle);
        }

        Ok(RateLimitStatus {
            count: int_field(&record, "count")?.unwrap_or(0),
            limit: rule.limit,
            reset_in_seconds,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::clock::ManualClock;

    const T0_MS: i64 = 1_700_000_000_000;

    fn limiter() -> (RateLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(T0_MS);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = RateLimiter::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::new(clock.clone()),
            RateLimitConfig::default(),
        );
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_call_over_limit_is_rejected_with_retry_after() {
        let (limiter, _, clock) = limiter();

        for _ in 0..2 {
            limiter
                .check_and_consume(Operation::Heartbeat, "conn-1")
                .await
                .unwrap();
        }
        clock.advance_ms(20_500);

        let err = limiter
            .check_and_consume(Operation::Heartbeat, "conn-1")
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.retry_after_seconds(), Some(40));
    }

    #[tokio::test]
    async fn test_next_window_allows_again() {
        let (limiter, _, clock) = limiter();
        for _ in 0..2 {
            limiter
                .check_and_consume(Operation::Heartbeat, "conn-1")
                .await
                .unwrap();
        }
        assert!(limiter
            .check_and_consume(Operation::Heartbeat, "conn-1")
            .await
            .is_err());

        clock.advance_ms(60_000);

        assert!(limiter
            .check_and_consume(Operation::Heartbeat, "conn-1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_identifiers_are_counted_separately() {
        let (limiter, _, _) = limiter();
        for _ in 0..2 {
            limiter
                .check_and_consume(Operation::Heartbeat, "conn-1")
                .await
                .unwrap();
        }

        assert!(limiter
            .check_and_consume(Operation::Heartbeat, "conn-2")
            .await
            .is_ok());
        assert!(limiter
            .check_and_consume(Operation::ListenerJoin, "conn-1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let (limiter, _, clock) = limiter();
        for _ in 0..2 {
            limiter
                .check_and_consume(Operation::Heartbeat, "conn-1")
                .await
                .unwrap();
        }
        clock.advance_ms(59_999);

        let err = limiter
            .check_and_consume(Operation::Heartbeat, "conn-1")
            .await
            .unwrap_err();

        assert_eq!(err.retry_after_seconds(), Some(1));
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let (limiter, store, _) = limiter();
        store.set_unavailable(true);

        for _ in 0..10 {
            assert!(limiter
                .check_and_consume(Operation::Heartbeat, "conn-1")
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_status_reports_open_window() {
        let (limiter, _, clock) = limiter();
        limiter
            .check_and_consume(Operation::ListenerJoin, "10.0.0.1")
            .await
            .unwrap();
        clock.advance_ms(15_000);

        let status = limiter
            .status(Operation::ListenerJoin, "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(
            status,
            RateLimitStatus {
                count: 1,
                limit: 10,
                reset_in_seconds: 45
            }
        );

        clock.advance_ms(45_000);
        let status = limiter
            .status(Operation::ListenerJoin, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(status.count, 0);
        assert_eq!(status.reset_in_seconds, 0);
    }

    #[test]
    fn test_seconds_until_reset_rounds_up() {
        assert_eq!(seconds_until_reset(0, 60_000, 0), 60);
        assert_eq!(seconds_until_reset(0, 60_000, 1), 60);
        assert_eq!(seconds_until_reset(0, 60_000, 59_001), 1);
        assert_eq!(seconds_until_reset(0, 60_000, 60_000), 0);
    }
}
