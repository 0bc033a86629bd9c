//! Store decorator adding per-call timeout, retry and circuit breaking.
//!
//! Retries depend on what the failed call may have done:
//! - Idempotent calls (reads, upserts, index maintenance) retry on any
//!   transient error.
//! - Conditional and counting calls (`update`, `increment`, `delete`,
//!   `put` with `IfAbsent`, `consume_window`) retry only when the store
//!   reports the command was never executed. A timeout leaves the outcome
//!   unknown, and replaying could double-apply or misreport a write that
//!   already landed.

use super::{
    Bounds, Condition, DeleteOutcome, IncrementOutcome, PutMode, PutOutcome, Record, StateStore,
    StoreError, UpdateOutcome, WindowCount,
};
use crate::observability::metrics;
use crate::resilience::{retry_async, CircuitBreaker, CircuitBreakerError, RetryPolicy};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Whether a failed call can be re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Idempotent,
    OnlyIfNotExecuted,
}

fn should_retry(error: &StoreError, replay: Replay) -> bool {
    if *error == StoreError::CircuitOpen {
        return false;
    }
    match replay {
        Replay::Idempotent => error.is_retryable(),
        Replay::OnlyIfNotExecuted => error.is_safe_to_replay(),
    }
}

pub struct ResilientStore<S> {
    inner: S,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl<S: StateStore> ResilientStore<S> {
    pub fn new(inner: S, retry: RetryPolicy, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            inner,
            retry,
            breaker,
            timeout,
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, replay: Replay, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let started = Instant::now();
        let f = &f;
        let breaker = &self.breaker;
        let timeout = self.timeout;

        let result = retry_async(
            &self.retry,
            op,
            |e: &StoreError| should_retry(e, replay),
            move || async move {
                breaker
                    .call(StoreError::trips_breaker, || async move {
                        tokio::time::timeout(timeout, f())
                            .await
                            .unwrap_or(Err(StoreError::Timeout))
                    })
                    .await
                    .map_err(|e| match e {
                        CircuitBreakerError::Open { .. } => StoreError::CircuitOpen,
                        CircuitBreakerError::Inner(inner) => inner,
                    })
            },
        )
        .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(StoreError::CircuitOpen) => "circuit_open",
            Err(StoreError::Timeout) => "timeout",
            Err(e) if e.is_retryable() => "unavailable",
            Err(_) => "error",
        };
        metrics::record_store_operation(op, outcome, started.elapsed());
        result
    }
}

#[async_trait]
impl<S: StateStore> StateStore for ResilientStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        self.run("get", Replay::Idempotent, || self.inner.get(key))
            .await
    }

    async fn put(
        &self,
        key: &str,
        record: &Record,
        expires_at_secs: i64,
        mode: PutMode,
    ) -> Result<PutOutcome, StoreError> {
        let replay = match mode {
            PutMode::Upsert => Replay::Idempotent,
            PutMode::IfAbsent => Replay::OnlyIfNotExecuted,
        };
        self.run("put", replay, || {
            self.inner.put(key, record, expires_at_secs, mode)
        })
        .await
    }

    async fn update(
        &self,
        key: &str,
        fields: &Record,
        conditions: &[Condition],
    ) -> Result<UpdateOutcome, StoreError> {
        self.run("update", Replay::OnlyIfNotExecuted, || {
            self.inner.update(key, fields, conditions)
        })
        .await
    }

    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        conditions: &[Condition],
        bounds: Bounds,
    ) -> Result<IncrementOutcome, StoreError> {
        self.run("increment", Replay::OnlyIfNotExecuted, || {
            self.inner.increment(key, field, delta, conditions, bounds)
        })
        .await
    }

    async fn delete(
        &self,
        key: &str,
        conditions: &[Condition],
    ) -> Result<DeleteOutcome, StoreError> {
        self.run("delete", Replay::OnlyIfNotExecuted, || {
            self.inner.delete(key, conditions)
        })
        .await
    }

    async fn index_add(
        &self,
        index: &str,
        member: &str,
        expires_at_secs: Option<i64>,
    ) -> Result<(), StoreError> {
        self.run("index_add", Replay::Idempotent, || {
            self.inner.index_add(index, member, expires_at_secs)
        })
        .await
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        self.run("index_remove", Replay::Idempotent, || {
            self.inner.index_remove(index, member)
        })
        .await
    }

    async fn query_index(&self, index: &str) -> Result<Vec<(String, Record)>, StoreError> {
        self.run("query_index", Replay::Idempotent, || {
            self.inner.query_index(index)
        })
        .await
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, StoreError> {
        self.run("index_members", Replay::Idempotent, || {
            self.inner.index_members(index)
        })
        .await
    }

    async fn score_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.run("score_set", Replay::Idempotent, || {
            self.inner.score_set(index, member, score)
        })
        .await
    }

    async fn score_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        self.run("score_remove", Replay::Idempotent, || {
            self.inner.score_remove(index, member)
        })
        .await
    }

    async fn score_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.run("score_range", Replay::Idempotent, || {
            self.inner.score_range(index, max_score, limit)
        })
        .await
    }

    async fn consume_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        expires_at_secs: i64,
    ) -> Result<WindowCount, StoreError> {
        self.run("consume_window", Replay::OnlyIfNotExecuted, || {
            self.inner
                .consume_window(key, now_ms, window_ms, expires_at_secs)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        // Probes bypass retry so readiness reflects the live state
        self.inner.ping().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::store::MemoryStore;
    use common::clock::ManualClock;

    fn resilient(failure_threshold: u32) -> ResilientStore<MemoryStore> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        ResilientStore::new(
            MemoryStore::new(clock),
            RetryPolicy::default(),
            Arc::new(CircuitBreaker::new(
                "state-store",
                CircuitBreakerConfig {
                    failure_threshold,
                    cooldown: Duration::from_secs(30),
                },
            )),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let store = resilient(5);
        store.inner.fail_next(2);

        let result = store.get("session:x").await;

        assert_eq!(result, Ok(None));
        assert_eq!(store.inner.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_error() {
        let store = resilient(10);
        store.inner.set_unavailable(true);

        let result = store.get("session:x").await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.inner.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let store = resilient(3);
        store.inner.set_unavailable(true);

        let _ = store.get("a").await;
        assert_eq!(store.breaker.state(), CircuitState::Open);
        let calls_before = store.inner.call_count();

        let result = store.get("b").await;

        assert_eq!(result, Err(StoreError::CircuitOpen));
        assert_eq!(store.inner.call_count(), calls_before);
    }

    #[test]
    fn test_retry_classification() {
        assert!(should_retry(&StoreError::Timeout, Replay::Idempotent));
        assert!(!should_retry(&StoreError::Timeout, Replay::OnlyIfNotExecuted));
        assert!(should_retry(
            &StoreError::Unavailable("refused".to_string()),
            Replay::OnlyIfNotExecuted
        ));
        assert!(!should_retry(&StoreError::CircuitOpen, Replay::Idempotent));
        assert!(!should_retry(
            &StoreError::Corrupt("x".to_string()),
            Replay::Idempotent
        ));
    }
}
