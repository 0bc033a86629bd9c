//! Durable store adapter.
//!
//! The controller keeps no shared state in process memory. Sessions,
//! connections and rate limit counters live in a key-value store that
//! offers conditional writes, atomic increments, secondary indexes and
//! per-item expiry. [`StateStore`] is the contract; [`RedisStore`] is the
//! production backend, [`MemoryStore`] backs tests and local runs, and
//! [`ResilientStore`] adds timeout, retry and circuit breaking around
//! either.
//!
//! # Record shape
//!
//! Records are flat string maps (Redis hashes). Numeric fields are stored as
//! decimal strings so `increment` can operate on them in place. Timestamps
//! are epoch milliseconds; expiry arguments are epoch seconds.

pub mod keys;
pub mod lua_scripts;
pub mod memory;
pub mod redis;
pub mod resilient;

pub use memory::MemoryStore;
pub use redis::RedisStore;
pub use resilient::ResilientStore;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// A stored record: field name to string value.
pub type Record = BTreeMap<String, String>;

/// Precondition evaluated atomically with a write.
///
/// A write on a missing record reports `Missing` before any condition is
/// evaluated, so existence is always implied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: String,
    pub value: String,
}

impl Condition {
    /// The record's `field` must currently equal `value`.
    pub fn field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace any existing record.
    Upsert,
    /// Write only if no record exists under the key.
    IfAbsent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Fields were written; carries the full record after the write.
    Applied(Record),
    ConditionFailed,
    Missing,
}

/// Optional inclusive bounds on the value produced by an increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Bounds {
    pub const fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    pub const fn at_least(min: i64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub const fn between(min: i64, max: i64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// New value after the increment.
    Applied(i64),
    ConditionFailed,
    Missing,
    /// The result would leave the bounds; nothing written. Carries the current value.
    OutOfBounds(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// This call removed the record; carries the record as it was.
    Deleted(Record),
    ConditionFailed,
    Missing,
}

/// Counter state after a fixed-window consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    pub window_start_ms: i64,
}

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached; the command was not executed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete in time; the outcome is unknown.
    #[error("store operation timed out")]
    Timeout,

    /// The connection failed mid-call; the outcome is unknown.
    #[error("store connection interrupted: {0}")]
    Interrupted(String),

    /// The store asked us to back off (busy, loading, try again). Not executed.
    #[error("store throttled: {0}")]
    Throttled(String),

    /// The circuit breaker is open; the store was not called.
    #[error("store circuit open")]
    CircuitOpen,

    /// A record or reply had an unexpected shape.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// Any other backend error.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failure eligible for retry and circuit breaking.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::Timeout
                | StoreError::Interrupted(_)
                | StoreError::Throttled(_)
                | StoreError::CircuitOpen
        )
    }

    /// Failure after which re-sending a non-idempotent command cannot
    /// double-apply it.
    pub fn is_safe_to_replay(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Throttled(_))
    }

    /// Whether the failure should count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_)
                | StoreError::Timeout
                | StoreError::Interrupted(_)
                | StoreError::Throttled(_)
        )
    }
}

/// Atomic primitives over the durable store.
///
/// Each method is a single atomic operation on the backend. Callers build
/// every shared-state mutation (counter changes, pointer swaps) out of one
/// of these calls with a precondition, never as read-then-write.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    async fn put(
        &self,
        key: &str,
        record: &Record,
        expires_at_secs: i64,
        mode: PutMode,
    ) -> Result<PutOutcome, StoreError>;

    /// Set `fields` on an existing record if every condition holds.
    async fn update(
        &self,
        key: &str,
        fields: &Record,
        conditions: &[Condition],
    ) -> Result<UpdateOutcome, StoreError>;

    /// Add `delta` to an integer field (missing field counts as 0).
    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        conditions: &[Condition],
        bounds: Bounds,
    ) -> Result<IncrementOutcome, StoreError>;

    async fn delete(&self, key: &str, conditions: &[Condition])
        -> Result<DeleteOutcome, StoreError>;

    /// Add a record key to an unordered index.
    async fn index_add(
        &self,
        index: &str,
        member: &str,
        expires_at_secs: Option<i64>,
    ) -> Result<(), StoreError>;

    async fn index_remove(&self, index: &str, member: &str) -> Result<(), StoreError>;

    /// Load every live record referenced by the index. Members whose record
    /// no longer exists are pruned from the index.
    async fn query_index(&self, index: &str) -> Result<Vec<(String, Record)>, StoreError>;

    async fn index_members(&self, index: &str) -> Result<Vec<String>, StoreError>;

    /// Insert or move a member in an ordered index.
    async fn score_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError>;

    async fn score_remove(&self, index: &str, member: &str) -> Result<(), StoreError>;

    /// Members with `score <= max_score`, lowest first, at most `limit`.
    async fn score_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError>;

    /// Fixed-window counter: start a new window at `now_ms` if none is open
    /// (or the open one has elapsed), else increment the open window.
    async fn consume_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        expires_at_secs: i64,
    ) -> Result<WindowCount, StoreError>;

    /// Liveness probe used by readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Parse an integer field, treating absence as `None`.
pub fn int_field(record: &Record, field: &str) -> Result<Option<i64>, StoreError> {
    record
        .get(field)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| StoreError::Corrupt(format!("field {field} is not an integer")))
        })
        .transpose()
}

/// Parse a boolean field stored as `"true"`/`"false"`.
pub fn bool_field(record: &Record, field: &str) -> Result<Option<bool>, StoreError> {
    record
        .get(field)
        .map(|raw| match raw.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(StoreError::Corrupt(format!("field {field} is not a boolean"))),
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contains() {
        assert!(Bounds::unbounded().contains(i64::MIN));
        assert!(Bounds::at_least(0).contains(0));
        assert!(!Bounds::at_least(0).contains(-1));
        assert!(Bounds::between(0, 500).contains(500));
        assert!(!Bounds::between(0, 500).contains(501));
    }

    #[test]
    fn test_error_classification() {
        assert!(StoreError::Timeout.is_retryable());
        assert!(!StoreError::Timeout.is_safe_to_replay());
        assert!(StoreError::Unavailable("refused".to_string()).is_safe_to_replay());
        assert!(!StoreError::Corrupt("x".to_string()).is_retryable());
        assert!(!StoreError::CircuitOpen.trips_breaker());
        assert!(StoreError::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_field_parsers() {
        let record = Record::from([
            ("count".to_string(), "7".to_string()),
            ("flag".to_string(), "true".to_string()),
            ("bad".to_string(), "seven".to_string()),
        ]);

        assert_eq!(int_field(&record, "count").unwrap(), Some(7));
        assert_eq!(int_field(&record, "absent").unwrap(), None);
        assert!(int_field(&record, "bad").is_err());
        assert_eq!(bool_field(&record, "flag").unwrap(), Some(true));
        assert!(bool_field(&record, "bad").is_err());
    }
}
