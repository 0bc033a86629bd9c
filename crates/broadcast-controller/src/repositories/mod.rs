//! Session and connection repositories over the durable store.

pub mod connections;
pub mod sessions;

pub use connections::{language_distribution, Connection, ConnectionRepository, Role};
pub use sessions::{
    BroadcastPatch, BroadcastState, ListenerCountChange, Session, SessionRepository, SessionWrite,
};

use crate::store::{Record, StoreError};

fn required_field(record: &Record, field: &str) -> Result<String, StoreError> {
    record
        .get(field)
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(format!("missing field {field}")))
}

/// Epoch milliseconds to epoch seconds.
fn timestamp_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}
