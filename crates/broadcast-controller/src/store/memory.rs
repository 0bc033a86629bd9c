//! In-process [`StateStore`] for tests and local development.
//!
//! Mirrors the Redis semantics: every call takes one lock, so each
//! primitive is atomic. Expiry is evaluated lazily against the injected
//! [`Clock`]. Failures can be injected to exercise the resilience layer.

use super::{
    Bounds, Condition, DeleteOutcome, IncrementOutcome, PutMode, PutOutcome, Record, StateStore,
    StoreError, UpdateOutcome, WindowCount,
};
use async_trait::async_trait;
use common::clock::Clock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    expires_at_secs: i64,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, Entry>,
    sets: HashMap<String, (BTreeSet<String>, Option<i64>)>,
    scores: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn live_record(&mut self, key: &str, now_secs: i64) -> Option<&mut Entry> {
        let expired = self
            .records
            .get(key)
            .is_some_and(|e| e.expires_at_secs <= now_secs);
        if expired {
            self.records.remove(key);
        }
        self.records.get_mut(key)
    }

    fn live_set(&mut self, index: &str, now_secs: i64) -> Option<&mut BTreeSet<String>> {
        let expired = self
            .sets
            .get(index)
            .is_some_and(|(_, exp)| exp.is_some_and(|e| e <= now_secs));
        if expired {
            self.sets.remove(index);
        }
        self.sets.get_mut(index).map(|(members, _)| members)
    }
}

fn conditions_hold(record: &Record, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|c| record.get(&c.field).is_some_and(|v| *v == c.value))
}

/// In-memory state store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    fail_index_add: AtomicU32,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            fail_index_add: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every call fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `index_add` calls, leaving every other call alone.
    pub fn fail_next_index_add(&self, n: u32) {
        self.fail_index_add.store(n, Ordering::SeqCst);
    }

    /// Number of calls that reached this store, including injected failures.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        Ok(state.live_record(key, now).map(|e| e.record.clone()))
    }

    async fn put(
        &self,
        key: &str,
        record: &Record,
        expires_at_secs: i64,
        mode: PutMode,
    ) -> Result<PutOutcome, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        if mode == PutMode::IfAbsent && state.live_record(key, now).is_some() {
            return Ok(PutOutcome::AlreadyExists);
        }
        state.records.insert(
            key.to_string(),
            Entry {
                record: record.clone(),
                expires_at_secs,
            },
        );
        Ok(PutOutcome::Written)
    }

    async fn update(
        &self,
        key: &str,
        fields: &Record,
        conditions: &[Condition],
    ) -> Result<UpdateOutcome, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        let Some(entry) = state.live_record(key, now) else {
            return Ok(UpdateOutcome::Missing);
        };
        if !conditions_hold(&entry.record, conditions) {
            return Ok(UpdateOutcome::ConditionFailed);
        }
        for (field, value) in fields {
            entry.record.insert(field.clone(), value.clone());
        }
        Ok(UpdateOutcome::Applied(entry.record.clone()))
    }

    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        conditions: &[Condition],
        bounds: Bounds,
    ) -> Result<IncrementOutcome, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        let Some(entry) = state.live_record(key, now) else {
            return Ok(IncrementOutcome::Missing);
        };
        if !conditions_hold(&entry.record, conditions) {
            return Ok(IncrementOutcome::ConditionFailed);
        }
        let current = super::int_field(&entry.record, field)?.unwrap_or(0);
        let next = current.saturating_add(delta);
        if !bounds.contains(next) {
            return Ok(IncrementOutcome::OutOfBounds(current));
        }
        entry.record.insert(field.to_string(), next.to_string());
        Ok(IncrementOutcome::Applied(next))
    }

    async fn delete(
        &self,
        key: &str,
        conditions: &[Condition],
    ) -> Result<DeleteOutcome, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        let Some(entry) = state.live_record(key, now) else {
            return Ok(DeleteOutcome::Missing);
        };
        if !conditions_hold(&entry.record, conditions) {
            return Ok(DeleteOutcome::ConditionFailed);
        }
        match state.records.remove(key) {
            Some(removed) => Ok(DeleteOutcome::Deleted(removed.record)),
            None => Ok(DeleteOutcome::Missing),
        }
    }

    async fn index_add(
        &self,
        index: &str,
        member: &str,
        expires_at_secs: Option<i64>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if self
            .fail_index_add
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected index failure".to_string()));
        }
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        // drop an expired set before re-adding
        let _ = state.live_set(index, now);
        let slot = state
            .sets
            .entry(index.to_string())
            .or_insert_with(|| (BTreeSet::new(), None));
        slot.0.insert(member.to_string());
        if expires_at_secs.is_some() {
            slot.1 = expires_at_secs;
        }
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        if let Some(members) = state.live_set(index, now) {
            members.remove(member);
        }
        Ok(())
    }

    async fn query_index(&self, index: &str) -> Result<Vec<(String, Record)>, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        let members: Vec<String> = state
            .live_set(index, now)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();

        let mut live = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for member in members {
            match state.live_record(&member, now) {
                Some(entry) => live.push((member, entry.record.clone())),
                None => stale.push(member),
            }
        }
        if let Some(set) = state.live_set(index, now) {
            for member in &stale {
                set.remove(member);
            }
        }
        Ok(live)
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        Ok(state
            .live_set(index, now)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn score_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .scores
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn score_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(scores) = state.scores.get_mut(index) {
            scores.remove(member);
        }
        Ok(())
    }

    async fn score_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut hits: Vec<(String, i64)> = state
            .scores
            .get(index)
            .map(|scores| {
                scores
                    .iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn consume_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        expires_at_secs: i64,
    ) -> Result<WindowCount, StoreError> {
        self.check_available()?;
        let now = self.now_secs();
        let mut state = self.state.lock().await;

        if let Some(entry) = state.live_record(key, now) {
            let start = super::int_field(&entry.record, "windowStart")?;
            if let Some(window_start_ms) = start.filter(|s| now_ms < s.saturating_add(window_ms)) {
                let count = super::int_field(&entry.record, "count")?
                    .unwrap_or(0)
                    .saturating_add(1);
                entry.record.insert("count".to_string(), count.to_string());
                return Ok(WindowCount {
                    count,
                    window_start_ms,
                });
            }
        }

        state.records.insert(
            key.to_string(),
            Entry {
                record: Record::from([
                    ("count".to_string(), "1".to_string()),
                    ("windowStart".to_string(), now_ms.to_string()),
                ]),
                expires_at_secs,
            },
        );
        Ok(WindowCount {
            count: 1,
            window_start_ms: now_ms,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::clock::ManualClock;

    const T0_MS: i64 = 1_700_000_000_000;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(T0_MS);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    fn rec(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn far_future() -> i64 {
        T0_MS / 1000 + 3600
    }

    #[tokio::test]
    async fn test_put_if_absent_detects_collision() {
        let (store, _) = store();
        let record = rec(&[("isActive", "true")]);

        let first = store
            .put("session:a", &record, far_future(), PutMode::IfAbsent)
            .await
            .unwrap();
        let second = store
            .put("session:a", &record, far_future(), PutMode::IfAbsent)
            .await
            .unwrap();

        assert_eq!(first, PutOutcome::Written);
        assert_eq!(second, PutOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_records_expire_with_clock() {
        let (store, clock) = store();
        store
            .put("k", &rec(&[("a", "1")]), T0_MS / 1000 + 10, PutMode::Upsert)
            .await
            .unwrap();

        assert!(store.get("k").await.unwrap().is_some());
        clock.advance_ms(10_000);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let (store, _) = store();
        store
            .put("k", &rec(&[("isActive", "true")]), far_future(), PutMode::Upsert)
            .await
            .unwrap();

        let applied = store
            .update(
                "k",
                &rec(&[("bsPaused", "true")]),
                &[Condition::field_equals("isActive", "true")],
            )
            .await
            .unwrap();
        let failed = store
            .update(
                "k",
                &rec(&[("bsPaused", "false")]),
                &[Condition::field_equals("isActive", "false")],
            )
            .await
            .unwrap();
        let missing = store.update("nope", &rec(&[]), &[]).await.unwrap();

        assert!(matches!(
            applied,
            UpdateOutcome::Applied(ref r) if r.get("bsPaused").map(String::as_str) == Some("true")
        ));
        assert_eq!(failed, UpdateOutcome::ConditionFailed);
        assert_eq!(missing, UpdateOutcome::Missing);
    }

    #[tokio::test]
    async fn test_increment_respects_bounds() {
        let (store, _) = store();
        store
            .put("k", &rec(&[("n", "1")]), far_future(), PutMode::Upsert)
            .await
            .unwrap();

        let up = store
            .increment("k", "n", 1, &[], Bounds::between(0, 2))
            .await
            .unwrap();
        let over = store
            .increment("k", "n", 1, &[], Bounds::between(0, 2))
            .await
            .unwrap();
        let down = store
            .increment("k", "n", -5, &[], Bounds::at_least(0))
            .await
            .unwrap();

        assert_eq!(up, IncrementOutcome::Applied(2));
        assert_eq!(over, IncrementOutcome::OutOfBounds(2));
        assert_eq!(down, IncrementOutcome::OutOfBounds(2));
    }

    #[tokio::test]
    async fn test_delete_returns_record_once() {
        let (store, _) = store();
        store
            .put("k", &rec(&[("role", "listener")]), far_future(), PutMode::Upsert)
            .await
            .unwrap();

        let first = store.delete("k", &[]).await.unwrap();
        let second = store.delete("k", &[]).await.unwrap();

        assert!(matches!(first, DeleteOutcome::Deleted(r) if r.get("role").map(String::as_str) == Some("listener")));
        assert_eq!(second, DeleteOutcome::Missing);
    }

    #[tokio::test]
    async fn test_query_index_prunes_missing_records() {
        let (store, _) = store();
        store
            .put("connection:a", &rec(&[("x", "1")]), far_future(), PutMode::Upsert)
            .await
            .unwrap();
        store.index_add("idx", "connection:a", None).await.unwrap();
        store.index_add("idx", "connection:gone", None).await.unwrap();

        let live = store.query_index("idx").await.unwrap();

        assert_eq!(live.len(), 1);
        assert_eq!(
            store.index_members("idx").await.unwrap(),
            vec!["connection:a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_score_range_orders_and_limits() {
        let (store, _) = store();
        store.score_set("z", "c", 30).await.unwrap();
        store.score_set("z", "a", 10).await.unwrap();
        store.score_set("z", "b", 20).await.unwrap();

        let hits = store.score_range("z", 25, 1).await.unwrap();
        assert_eq!(hits, vec![("a".to_string(), 10)]);

        let hits = store.score_range("z", 25, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_consume_window_resets_after_window() {
        let (store, _) = store();
        let exp = far_future();

        let a = store.consume_window("rl", T0_MS, 60_000, exp).await.unwrap();
        let b = store
            .consume_window("rl", T0_MS + 59_999, 60_000, exp)
            .await
            .unwrap();
        let c = store
            .consume_window("rl", T0_MS + 60_000, 60_000, exp)
            .await
            .unwrap();

        assert_eq!((a.count, a.window_start_ms), (1, T0_MS));
        assert_eq!((b.count, b.window_start_ms), (2, T0_MS));
        assert_eq!((c.count, c.window_start_ms), (1, T0_MS + 60_000));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (store, _) = store();

        store.fail_next(1);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("k").await.is_ok());

        store.set_unavailable(true);
        assert!(store.ping().await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
        assert_eq!(store.call_count(), 4);
    }
}
