//! Session records and their atomic transitions.
//!
//! Every write to `listenerCount`, `speakerConnectionId` or the broadcast
//! state is a single conditional store call gated on `isActive = true`.
//! Broadcast state lives in individual `bs*` fields so concurrent control
//! changes to different fields never overwrite each other.

use super::{required_field, timestamp_secs};
use crate::store::{
    bool_field, int_field, keys, Bounds, Condition, IncrementOutcome, PutMode, PutOutcome, Record,
    StateStore, StoreError, UpdateOutcome,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub const SESSION_ID: &str = "sessionId";
pub const SPEAKER_ID: &str = "speakerId";
pub const SOURCE_LANGUAGE: &str = "sourceLanguage";
pub const QUALITY_TIER: &str = "qualityTier";
pub const IS_ACTIVE: &str = "isActive";
pub const LISTENER_COUNT: &str = "listenerCount";
pub const SPEAKER_CONNECTION_ID: &str = "speakerConnectionId";
pub const CREATED_AT: &str = "createdAt";
pub const EXPIRES_AT: &str = "expiresAt";
pub const BS_ACTIVE: &str = "bsActive";
pub const BS_PAUSED: &str = "bsPaused";
pub const BS_MUTED: &str = "bsMuted";
pub const BS_VOLUME: &str = "bsVolume";
pub const BS_LAST_STATE_CHANGE: &str = "bsLastStateChange";

fn active() -> Condition {
    Condition::field_equals(IS_ACTIVE, "true")
}

/// Speaker-controlled playback state shared with every listener.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastState {
    pub is_active: bool,
    pub is_paused: bool,
    pub is_muted: bool,
    /// Always within `[0.0, 1.0]`.
    pub volume: f64,
    /// Epoch milliseconds of the last write.
    pub last_state_change: i64,
}

impl BroadcastState {
    pub fn initial(now_ms: i64) -> Self {
        Self {
            is_active: true,
            is_paused: false,
            is_muted: false,
            volume: 1.0,
            last_state_change: now_ms,
        }
    }

    fn write_fields(&self, record: &mut Record) {
        record.insert(BS_ACTIVE.to_string(), self.is_active.to_string());
        record.insert(BS_PAUSED.to_string(), self.is_paused.to_string());
        record.insert(BS_MUTED.to_string(), self.is_muted.to_string());
        record.insert(BS_VOLUME.to_string(), self.volume.to_string());
        record.insert(
            BS_LAST_STATE_CHANGE.to_string(),
            self.last_state_change.to_string(),
        );
    }

    fn from_record(record: &Record) -> Result<Self, StoreError> {
        let volume = match record.get(BS_VOLUME) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| StoreError::Corrupt(format!("field {BS_VOLUME} is not a number")))?,
            None => 1.0,
        };
        Ok(Self {
            is_active: bool_field(record, BS_ACTIVE)?.unwrap_or(true),
            is_paused: bool_field(record, BS_PAUSED)?.unwrap_or(false),
            is_muted: bool_field(record, BS_MUTED)?.unwrap_or(false),
            volume: volume.clamp(0.0, 1.0),
            last_state_change: int_field(record, BS_LAST_STATE_CHANGE)?.unwrap_or(0),
        })
    }
}

/// Partial broadcast state write. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BroadcastPatch {
    pub is_active: Option<bool>,
    pub is_paused: Option<bool>,
    pub is_muted: Option<bool>,
    pub volume: Option<f64>,
}

impl BroadcastPatch {
    fn to_fields(self, now_ms: i64) -> Record {
        let mut fields = Record::new();
        if let Some(v) = self.is_active {
            fields.insert(BS_ACTIVE.to_string(), v.to_string());
        }
        if let Some(v) = self.is_paused {
            fields.insert(BS_PAUSED.to_string(), v.to_string());
        }
        if let Some(v) = self.is_muted {
            fields.insert(BS_MUTED.to_string(), v.to_string());
        }
        if let Some(v) = self.volume {
            fields.insert(BS_VOLUME.to_string(), v.clamp(0.0, 1.0).to_string());
        }
        fields.insert(BS_LAST_STATE_CHANGE.to_string(), now_ms.to_string());
        fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub speaker_id: String,
    pub source_language: String,
    pub quality_tier: String,
    pub is_active: bool,
    pub listener_count: i64,
    pub broadcast_state: BroadcastState,
    pub speaker_connection_id: String,
    pub created_at: i64,
    /// Epoch seconds.
    pub expires_at: i64,
}

impl Session {
    pub fn to_record(&self) -> Record {
        let mut record = Record::from([
            (SESSION_ID.to_string(), self.session_id.clone()),
            (SPEAKER_ID.to_string(), self.speaker_id.clone()),
            (SOURCE_LANGUAGE.to_string(), self.source_language.clone()),
            (QUALITY_TIER.to_string(), self.quality_tier.clone()),
            (IS_ACTIVE.to_string(), self.is_active.to_string()),
            (LISTENER_COUNT.to_string(), self.listener_count.to_string()),
            (
                SPEAKER_CONNECTION_ID.to_string(),
                self.speaker_connection_id.clone(),
            ),
            (CREATED_AT.to_string(), self.created_at.to_string()),
            (EXPIRES_AT.to_string(), self.expires_at.to_string()),
        ]);
        self.broadcast_state.write_fields(&mut record);
        record
    }

    pub fn from_record(record: &Record) -> Result<Self, StoreError> {
        Ok(Self {
            session_id: required_field(record, SESSION_ID)?,
            speaker_id: required_field(record, SPEAKER_ID)?,
            source_language: required_field(record, SOURCE_LANGUAGE)?,
            quality_tier: required_field(record, QUALITY_TIER)?,
            is_active: bool_field(record, IS_ACTIVE)?.unwrap_or(false),
            listener_count: int_field(record, LISTENER_COUNT)?.unwrap_or(0).max(0),
            broadcast_state: BroadcastState::from_record(record)?,
            speaker_connection_id: record
                .get(SPEAKER_CONNECTION_ID)
                .cloned()
                .unwrap_or_default(),
            created_at: int_field(record, CREATED_AT)?.unwrap_or(0),
            expires_at: int_field(record, EXPIRES_AT)?.unwrap_or(0),
        })
    }
}

/// Result of a conditional session mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionWrite<T> {
    Applied(T),
    /// The session exists but is no longer active (or the pointer moved).
    Rejected,
    Missing,
}

/// Result of a bounded listener count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCountChange {
    Applied(i64),
    /// Would pass the cap (increment) or go negative (decrement).
    AtLimit(i64),
    Inactive,
    Missing,
}

impl From<IncrementOutcome> for ListenerCountChange {
    fn from(outcome: IncrementOutcome) -> Self {
        match outcome {
            IncrementOutcome::Applied(v) => ListenerCountChange::Applied(v),
            IncrementOutcome::OutOfBounds(v) => ListenerCountChange::AtLimit(v),
            IncrementOutcome::ConditionFailed => ListenerCountChange::Inactive,
            IncrementOutcome::Missing => ListenerCountChange::Missing,
        }
    }
}

pub struct SessionRepository {
    store: Arc<dyn StateStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Insert a new session if the id is free. Returns false on collision.
    pub async fn create(&self, session: &Session) -> Result<bool, StoreError> {
        let key = keys::session(&session.session_id);
        let outcome = self
            .store
            .put(&key, &session.to_record(), session.expires_at, PutMode::IfAbsent)
            .await?;
        if outcome == PutOutcome::AlreadyExists {
            return Ok(false);
        }
        if let Err(e) = self
            .store
            .index_add(keys::ACTIVE_SESSIONS_INDEX, &key, None)
            .await
        {
            // An active session missing from the index never gets periodic status.
            if let Err(delete_err) = self.store.delete(&key, &[]).await {
                warn!(
                    target: "bc.repositories",
                    session_id = %session.session_id,
                    error = %delete_err,
                    "Failed to delete session after index failure"
                );
            }
            return Err(e);
        }
        Ok(true)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.store
            .get(&keys::session(session_id))
            .await?
            .map(|record| Session::from_record(&record))
            .transpose()
    }

    /// Add one listener unless the count would pass `max_listeners`.
    pub async fn add_listener(
        &self,
        session_id: &str,
        max_listeners: i64,
    ) -> Result<ListenerCountChange, StoreError> {
        let outcome = self
            .store
            .increment(
                &keys::session(session_id),
                LISTENER_COUNT,
                1,
                &[active()],
                Bounds::between(0, max_listeners),
            )
            .await?;
        Ok(outcome.into())
    }

    /// Add one listener with no cap. Used while a listener migrates to a
    /// new connection and both rows briefly coexist.
    pub async fn add_listener_uncapped(
        &self,
        session_id: &str,
    ) -> Result<ListenerCountChange, StoreError> {
        let outcome = self
            .store
            .increment(
                &keys::session(session_id),
                LISTENER_COUNT,
                1,
                &[active()],
                Bounds::unbounded(),
            )
            .await?;
        Ok(outcome.into())
    }

    /// Remove one listener, never going below zero.
    pub async fn remove_listener(&self, session_id: &str) -> Result<ListenerCountChange, StoreError> {
        let outcome = self
            .store
            .increment(
                &keys::session(session_id),
                LISTENER_COUNT,
                -1,
                &[active()],
                Bounds::at_least(0),
            )
            .await?;
        Ok(outcome.into())
    }

    /// Point the session at a new speaker connection.
    pub async fn set_speaker_connection(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<SessionWrite<Session>, StoreError> {
        let fields = Record::from([(SPEAKER_CONNECTION_ID.to_string(), connection_id.to_string())]);
        self.conditional_update(session_id, &fields, &[active()])
            .await
    }

    /// Deactivate the session if `speaker_connection_id` is still the
    /// current speaker connection.
    pub async fn end(
        &self,
        session_id: &str,
        speaker_connection_id: &str,
        now_ms: i64,
    ) -> Result<SessionWrite<Session>, StoreError> {
        let mut fields = BroadcastPatch {
            is_active: Some(false),
            ..BroadcastPatch::default()
        }
        .to_fields(now_ms);
        fields.insert(IS_ACTIVE.to_string(), "false".to_string());

        let result = self
            .conditional_update(
                session_id,
                &fields,
                &[
                    active(),
                    Condition::field_equals(SPEAKER_CONNECTION_ID, speaker_connection_id),
                ],
            )
            .await?;
        if matches!(result, SessionWrite::Applied(_)) {
            self.store
                .index_remove(keys::ACTIVE_SESSIONS_INDEX, &keys::session(session_id))
                .await?;
        }
        Ok(result)
    }

    /// Apply a broadcast state change, stamping `lastStateChange`.
    pub async fn apply_broadcast_patch(
        &self,
        session_id: &str,
        patch: BroadcastPatch,
        now_ms: i64,
    ) -> Result<SessionWrite<Session>, StoreError> {
        self.conditional_update(session_id, &patch.to_fields(now_ms), &[active()])
            .await
    }

    /// Ids of sessions currently marked active.
    pub async fn active_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let members = self.store.index_members(keys::ACTIVE_SESSIONS_INDEX).await?;
        let mut ids: Vec<String> = members
            .iter()
            .filter_map(|key| keys::session_id_from_key(key))
            .map(ToString::to_string)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drop a session from the active index (expired or already ended).
    pub async fn forget_active(&self, session_id: &str) -> Result<(), StoreError> {
        self.store
            .index_remove(keys::ACTIVE_SESSIONS_INDEX, &keys::session(session_id))
            .await
    }

    async fn conditional_update(
        &self,
        session_id: &str,
        fields: &Record,
        conditions: &[Condition],
    ) -> Result<SessionWrite<Session>, StoreError> {
        match self
            .store
            .update(&keys::session(session_id), fields, conditions)
            .await?
        {
            UpdateOutcome::Applied(record) => Ok(SessionWrite::Applied(Session::from_record(&record)?)),
            UpdateOutcome::ConditionFailed => Ok(SessionWrite::Rejected),
            UpdateOutcome::Missing => Ok(SessionWrite::Missing),
        }
    }
}

/// Absolute expiry for a session created at `now_ms`.
pub fn session_expiry(now_ms: i64, ttl_seconds: i64) -> i64 {
    timestamp_secs(now_ms).saturating_add(ttl_seconds)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::clock::ManualClock;

    const T0_MS: i64 = 1_700_000_000_000;

    fn repo() -> SessionRepository {
        let clock = Arc::new(ManualClock::new(T0_MS));
        SessionRepository::new(Arc::new(MemoryStore::new(clock)))
    }

    fn session(id: &str) -> Session {
        Session {
            session_id: id.to_string(),
            speaker_id: "speaker-1".to_string(),
            source_language: "en".to_string(),
            quality_tier: "standard".to_string(),
            is_active: true,
            listener_count: 0,
            broadcast_state: BroadcastState::initial(T0_MS),
            speaker_connection_id: "conn-s1".to_string(),
            created_at: T0_MS,
            expires_at: session_expiry(T0_MS, 3600),
        }
    }

    #[tokio::test]
    async fn test_create_detects_collision() {
        let repo = repo();

        assert!(repo.create(&session("calm-otter-001")).await.unwrap());
        assert!(!repo.create(&session("calm-otter-001")).await.unwrap());

        let stored = repo.get("calm-otter-001").await.unwrap().unwrap();
        assert_eq!(stored, session("calm-otter-001"));
        assert_eq!(
            repo.active_session_ids().await.unwrap(),
            vec!["calm-otter-001".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_index_write_leaves_no_session() {
        let clock = Arc::new(ManualClock::new(T0_MS));
        let store = Arc::new(MemoryStore::new(clock));
        let repo = SessionRepository::new(store.clone());
        store.fail_next_index_add(1);

        assert!(repo.create(&session("calm-otter-001")).await.is_err());
        assert_eq!(repo.get("calm-otter-001").await.unwrap(), None);

        // The id is free again for the retry.
        assert!(repo.create(&session("calm-otter-001")).await.unwrap());
        assert_eq!(
            repo.active_session_ids().await.unwrap(),
            vec!["calm-otter-001".to_string()]
        );
    }

    #[tokio::test]
    async fn test_listener_cap_and_floor() {
        let repo = repo();
        repo.create(&session("s")).await.unwrap();

        assert_eq!(
            repo.add_listener("s", 2).await.unwrap(),
            ListenerCountChange::Applied(1)
        );
        assert_eq!(
            repo.add_listener("s", 2).await.unwrap(),
            ListenerCountChange::Applied(2)
        );
        assert_eq!(
            repo.add_listener("s", 2).await.unwrap(),
            ListenerCountChange::AtLimit(2)
        );
        assert_eq!(
            repo.add_listener_uncapped("s").await.unwrap(),
            ListenerCountChange::Applied(3)
        );

        for expected in [2, 1, 0] {
            assert_eq!(
                repo.remove_listener("s").await.unwrap(),
                ListenerCountChange::Applied(expected)
            );
        }
        assert_eq!(
            repo.remove_listener("s").await.unwrap(),
            ListenerCountChange::AtLimit(0)
        );
        assert_eq!(
            repo.add_listener("missing", 2).await.unwrap(),
            ListenerCountChange::Missing
        );
    }

    #[tokio::test]
    async fn test_end_requires_current_speaker_connection() {
        let repo = repo();
        repo.create(&session("s")).await.unwrap();
        repo.set_speaker_connection("s", "conn-s2").await.unwrap();

        assert_eq!(
            repo.end("s", "conn-s1", T0_MS).await.unwrap(),
            SessionWrite::Rejected
        );

        let ended = repo.end("s", "conn-s2", T0_MS + 5).await.unwrap();
        let SessionWrite::Applied(ended) = ended else {
            unreachable!("session should end");
        };
        assert!(!ended.is_active);
        assert!(!ended.broadcast_state.is_active);
        assert!(repo.active_session_ids().await.unwrap().is_empty());

        assert_eq!(
            repo.add_listener("s", 10).await.unwrap(),
            ListenerCountChange::Inactive
        );
    }

    #[tokio::test]
    async fn test_broadcast_patch_touches_only_given_fields() {
        let repo = repo();
        repo.create(&session("s")).await.unwrap();

        repo.apply_broadcast_patch(
            "s",
            BroadcastPatch {
                is_paused: Some(true),
                ..BroadcastPatch::default()
            },
            T0_MS + 10,
        )
        .await
        .unwrap();
        let result = repo
            .apply_broadcast_patch(
                "s",
                BroadcastPatch {
                    volume: Some(0.25),
                    ..BroadcastPatch::default()
                },
                T0_MS + 20,
            )
            .await
            .unwrap();

        let SessionWrite::Applied(updated) = result else {
            unreachable!("patch should apply");
        };
        assert_eq!(
            updated.broadcast_state,
            BroadcastState {
                is_active: true,
                is_paused: true,
                is_muted: false,
                volume: 0.25,
                last_state_change: T0_MS + 20,
            }
        );
    }
}
