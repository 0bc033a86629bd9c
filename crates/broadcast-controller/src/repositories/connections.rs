//! Connection records.
//!
//! A connection row is indexed twice: under its session (for listener
//! enumeration and per-language counts) and in the activity index scored
//! by `lastActivityAt` (for the idle sweep). Removal goes through a single
//! atomic delete so that only one caller ever observes the removed row.

use super::{required_field, timestamp_secs};
use crate::store::{
    int_field, keys, Condition, DeleteOutcome, PutMode, PutOutcome, Record, StateStore,
    StoreError, UpdateOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub const CONNECTION_ID: &str = "connectionId";
pub const SESSION_ID: &str = "sessionId";
pub const ROLE: &str = "role";
pub const TARGET_LANGUAGE: &str = "targetLanguage";
pub const USER_ID: &str = "userId";
pub const CLIENT_IP: &str = "clientIp";
pub const CONNECTED_AT: &str = "connectedAt";
pub const LAST_ACTIVITY_AT: &str = "lastActivityAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Speaker,
    Listener,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Speaker => "speaker",
            Role::Listener => "listener",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "speaker" => Some(Role::Speaker),
            "listener" => Some(Role::Listener),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub connection_id: String,
    pub session_id: String,
    pub role: Role,
    /// Listener only.
    pub target_language: Option<String>,
    /// Speaker only: verified identity that opened the connection.
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub connected_at: i64,
    pub last_activity_at: i64,
}

impl Connection {
    pub fn to_record(&self) -> Record {
        let mut record = Record::from([
            (CONNECTION_ID.to_string(), self.connection_id.clone()),
            (SESSION_ID.to_string(), self.session_id.clone()),
            (ROLE.to_string(), self.role.as_str().to_string()),
            (CONNECTED_AT.to_string(), self.connected_at.to_string()),
            (LAST_ACTIVITY_AT.to_string(), self.last_activity_at.to_string()),
        ]);
        if let Some(language) = &self.target_language {
            record.insert(TARGET_LANGUAGE.to_string(), language.clone());
        }
        if let Some(user_id) = &self.user_id {
            record.insert(USER_ID.to_string(), user_id.clone());
        }
        if let Some(ip) = &self.client_ip {
            record.insert(CLIENT_IP.to_string(), ip.clone());
        }
        record
    }

    pub fn from_record(record: &Record) -> Result<Self, StoreError> {
        let role_raw = required_field(record, ROLE)?;
        let role = Role::parse(&role_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown role {role_raw}")))?;
        let connected_at = int_field(record, CONNECTED_AT)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing field {CONNECTED_AT}")))?;
        Ok(Self {
            connection_id: required_field(record, CONNECTION_ID)?,
            session_id: required_field(record, SESSION_ID)?,
            role,
            target_language: record.get(TARGET_LANGUAGE).cloned(),
            user_id: record.get(USER_ID).cloned(),
            client_ip: record.get(CLIENT_IP).cloned(),
            connected_at,
            last_activity_at: int_field(record, LAST_ACTIVITY_AT)?.unwrap_or(connected_at),
        })
    }

    /// Age in whole minutes at `now_ms`.
    pub fn age_minutes(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.connected_at).max(0) / 60_000
    }
}

/// Listener count per target language.
pub fn language_distribution(connections: &[Connection]) -> BTreeMap<String, i64> {
    let mut distribution = BTreeMap::new();
    for connection in connections {
        if connection.role != Role::Listener {
            continue;
        }
        if let Some(language) = &connection.target_language {
            *distribution.entry(language.clone()).or_insert(0) += 1;
        }
    }
    distribution
}

pub struct ConnectionRepository {
    store: Arc<dyn StateStore>,
    ttl_seconds: i64,
}

impl ConnectionRepository {
    pub fn new(store: Arc<dyn StateStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    /// Insert a new connection row and index it. Returns false if a row
    /// with the same id already exists.
    ///
    /// If either index write fails the row is deleted again before the
    /// error is returned, so a failed insert never leaves a row that the
    /// sweep cannot find.
    pub async fn insert(&self, connection: &Connection) -> Result<bool, StoreError> {
        let key = keys::connection(&connection.connection_id);
        let session_index = keys::session_connections(&connection.session_id);
        let expires_at = timestamp_secs(connection.connected_at).saturating_add(self.ttl_seconds);
        let outcome = self
            .store
            .put(&key, &connection.to_record(), expires_at, PutMode::IfAbsent)
            .await?;
        if outcome == PutOutcome::AlreadyExists {
            return Ok(false);
        }

        if let Err(e) = self
            .store
            .index_add(&session_index, &key, Some(expires_at))
            .await
        {
            self.unwind_insert(&key, None).await;
            return Err(e);
        }
        if let Err(e) = self
            .store
            .score_set(keys::ACTIVITY_INDEX, &key, connection.last_activity_at)
            .await
        {
            self.unwind_insert(&key, Some(&session_index)).await;
            return Err(e);
        }
        Ok(true)
    }

    async fn unwind_insert(&self, key: &str, session_index: Option<&str>) {
        if let Some(index) = session_index {
            if let Err(e) = self.store.index_remove(index, key).await {
                warn!(
                    target: "bc.repositories",
                    key = %key,
                    error = %e,
                    "Failed to unindex connection after insert failure"
                );
            }
        }
        if let Err(e) = self.store.delete(key, &[]).await {
            warn!(
                target: "bc.repositories",
                key = %key,
                error = %e,
                "Failed to delete connection after insert failure"
            );
        }
    }

    pub async fn get(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        self.store
            .get(&keys::connection(connection_id))
            .await?
            .map(|record| Connection::from_record(&record))
            .transpose()
    }

    /// Bump `lastActivityAt`. Returns the updated row, or `None` if gone.
    pub async fn touch(
        &self,
        connection_id: &str,
        now_ms: i64,
    ) -> Result<Option<Connection>, StoreError> {
        let key = keys::connection(connection_id);
        let fields = Record::from([(LAST_ACTIVITY_AT.to_string(), now_ms.to_string())]);
        match self.store.update(&key, &fields, &[]).await? {
            UpdateOutcome::Applied(record) => {
                self.store.score_set(keys::ACTIVITY_INDEX, &key, now_ms).await?;
                Ok(Some(Connection::from_record(&record)?))
            }
            UpdateOutcome::ConditionFailed | UpdateOutcome::Missing => Ok(None),
        }
    }

    /// Change a listener's target language. Returns `None` if the row is
    /// gone or is not a listener.
    pub async fn set_target_language(
        &self,
        connection_id: &str,
        language: &str,
    ) -> Result<Option<Connection>, StoreError> {
        let fields = Record::from([(TARGET_LANGUAGE.to_string(), language.to_string())]);
        match self
            .store
            .update(
                &keys::connection(connection_id),
                &fields,
                &[Condition::field_equals(ROLE, Role::Listener.as_str())],
            )
            .await?
        {
            UpdateOutcome::Applied(record) => Ok(Some(Connection::from_record(&record)?)),
            UpdateOutcome::ConditionFailed | UpdateOutcome::Missing => Ok(None),
        }
    }

    /// Delete the row. Exactly one concurrent caller receives `Some`.
    pub async fn remove(&self, connection_id: &str) -> Result<Option<Connection>, StoreError> {
        let key = keys::connection(connection_id);
        let removed = match self.store.delete(&key, &[]).await? {
            DeleteOutcome::Deleted(record) => Some(Connection::from_record(&record)?),
            DeleteOutcome::ConditionFailed | DeleteOutcome::Missing => None,
        };

        if let Some(connection) = &removed {
            self.store
                .index_remove(&keys::session_connections(&connection.session_id), &key)
                .await?;
        }
        self.store.score_remove(keys::ACTIVITY_INDEX, &key).await?;
        Ok(removed)
    }

    /// Every live connection of a session, speaker included.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Connection>, StoreError> {
        self.store
            .query_index(&keys::session_connections(session_id))
            .await?
            .iter()
            .map(|(_, record)| Connection::from_record(record))
            .collect()
    }

    pub async fn listeners(&self, session_id: &str) -> Result<Vec<Connection>, StoreError> {
        let mut all = self.list_for_session(session_id).await?;
        all.retain(|c| c.role == Role::Listener);
        Ok(all)
    }

    /// Connection ids idle since before `cutoff_ms`, oldest first.
    pub async fn idle_since(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(self
            .store
            .score_range(keys::ACTIVITY_INDEX, cutoff_ms, limit)
            .await?
            .into_iter()
            .filter_map(|(key, score)| {
                keys::connection_id_from_key(&key).map(|id| (id.to_string(), score))
            })
            .collect())
    }

    /// Reset the activity score from the row's `lastActivityAt`.
    pub async fn rescore_activity(&self, connection: &Connection) -> Result<(), StoreError> {
        self.store
            .score_set(
                keys::ACTIVITY_INDEX,
                &keys::connection(&connection.connection_id),
                connection.last_activity_at,
            )
            .await
    }

    /// Drop an activity index entry whose row has already expired.
    pub async fn forget_activity(&self, connection_id: &str) -> Result<(), StoreError> {
        self.store
            .score_remove(keys::ACTIVITY_INDEX, &keys::connection(connection_id))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::clock::ManualClock;

    const T0_MS: i64 = 1_700_000_000_000;

    fn repo() -> ConnectionRepository {
        repo_with_store().0
    }

    fn repo_with_store() -> (ConnectionRepository, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(T0_MS));
        let store = Arc::new(MemoryStore::new(clock));
        (ConnectionRepository::new(store.clone(), 3 * 3600), store)
    }

    fn listener(id: &str, language: &str) -> Connection {
        Connection {
            connection_id: id.to_string(),
            session_id: "calm-otter-001".to_string(),
            role: Role::Listener,
            target_language: Some(language.to_string()),
            user_id: None,
            client_ip: Some("10.0.0.1".to_string()),
            connected_at: T0_MS,
            last_activity_at: T0_MS,
        }
    }

    #[tokio::test]
    async fn test_insert_get_and_list() {
        let repo = repo();
        repo.insert(&listener("l1", "es")).await.unwrap();
        repo.insert(&listener("l2", "fr")).await.unwrap();

        assert_eq!(repo.get("l1").await.unwrap(), Some(listener("l1", "es")));
        let listed = repo.listeners("calm-otter-001").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            language_distribution(&listed),
            BTreeMap::from([("es".to_string(), 1), ("fr".to_string(), 1)])
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let repo = repo();
        repo.insert(&listener("l1", "es")).await.unwrap();

        assert!(!repo.insert(&listener("l1", "es")).await.unwrap());
        assert_eq!(repo.listeners("calm-otter-001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_index_write_leaves_no_row() {
        let (repo, store) = repo_with_store();
        store.fail_next_index_add(1);

        assert!(matches!(
            repo.insert(&listener("l1", "es")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(repo.get("l1").await.unwrap(), None);
        assert_eq!(repo.remove("l1").await.unwrap(), None);

        assert!(repo.insert(&listener("l1", "es")).await.unwrap());
        assert_eq!(repo.listeners("calm-otter-001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_returns_row_once() {
        let repo = repo();
        repo.insert(&listener("l1", "es")).await.unwrap();

        let first = repo.remove("l1").await.unwrap();
        let second = repo.remove("l1").await.unwrap();

        assert_eq!(first, Some(listener("l1", "es")));
        assert_eq!(second, None);
        assert!(repo.listeners("calm-otter-001").await.unwrap().is_empty());
        assert!(repo.idle_since(i64::MAX, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_moves_activity_score() {
        let repo = repo();
        repo.insert(&listener("l1", "es")).await.unwrap();
        repo.insert(&listener("l2", "es")).await.unwrap();

        let touched = repo.touch("l2", T0_MS + 60_000).await.unwrap().unwrap();

        assert_eq!(touched.last_activity_at, T0_MS + 60_000);
        assert_eq!(
            repo.idle_since(T0_MS + 1, 10).await.unwrap(),
            vec![("l1".to_string(), T0_MS)]
        );
        assert_eq!(repo.touch("gone", T0_MS).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_language_change_only_for_listeners() {
        let repo = repo();
        repo.insert(&listener("l1", "es")).await.unwrap();
        let mut speaker = listener("s1", "en");
        speaker.role = Role::Speaker;
        speaker.target_language = None;
        repo.insert(&speaker).await.unwrap();

        let changed = repo.set_target_language("l1", "de").await.unwrap().unwrap();
        assert_eq!(changed.target_language.as_deref(), Some("de"));
        assert_eq!(repo.set_target_language("s1", "de").await.unwrap(), None);
    }

    #[test]
    fn test_age_minutes() {
        let conn = listener("l1", "es");
        assert_eq!(conn.age_minutes(T0_MS + 99 * 60_000 + 59_999), 99);
        assert_eq!(conn.age_minutes(T0_MS + 100 * 60_000), 100);
        assert_eq!(conn.age_minutes(T0_MS - 1), 0);
    }
}
