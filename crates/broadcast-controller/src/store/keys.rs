//! Key layout.
//!
//! - `session:{id}` - session record (HASH)
//! - `session:{id}:connections` - connection keys of the session (SET)
//! - `connection:{id}` - connection record (HASH)
//! - `connections:activity` - connection keys scored by `lastActivityAt` (ZSET)
//! - `sessions:active` - session keys of active sessions (SET)
//! - `ratelimit:{operation}:{identifierType}:{identifierValue}` - counters (HASH)

pub const ACTIVITY_INDEX: &str = "connections:activity";
pub const ACTIVE_SESSIONS_INDEX: &str = "sessions:active";

const SESSION_PREFIX: &str = "session:";
const CONNECTION_PREFIX: &str = "connection:";

pub fn session(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

pub fn session_connections(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}:connections")
}

pub fn connection(connection_id: &str) -> String {
    format!("{CONNECTION_PREFIX}{connection_id}")
}

pub fn rate_limit(operation: &str, identifier_type: &str, identifier: &str) -> String {
    format!("ratelimit:{operation}:{identifier_type}:{identifier}")
}

/// Recover a connection id from its record key.
pub fn connection_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(CONNECTION_PREFIX)
}

/// Recover a session id from its record key.
pub fn session_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_PREFIX)
        .filter(|rest| !rest.contains(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(session("calm-otter-042"), "session:calm-otter-042");
        assert_eq!(
            session_connections("calm-otter-042"),
            "session:calm-otter-042:connections"
        );
        assert_eq!(connection("c1"), "connection:c1");
        assert_eq!(
            rate_limit("listenerJoin", "ip", "10.0.0.1"),
            "ratelimit:listenerJoin:ip:10.0.0.1"
        );
    }

    #[test]
    fn test_ids_from_keys() {
        assert_eq!(connection_id_from_key("connection:c1"), Some("c1"));
        assert_eq!(connection_id_from_key("session:c1"), None);
        assert_eq!(session_id_from_key("session:calm-otter-042"), Some("calm-otter-042"));
        assert_eq!(session_id_from_key("session:calm-otter-042:connections"), None);
    }
}
