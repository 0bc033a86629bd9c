//! Redis-backed [`StateStore`].
//!
//! Records are Redis hashes with `EXPIREAT` expiry; unordered indexes are
//! sets and the activity index is a sorted set. Conditional writes run as
//! precompiled Lua scripts (see [`lua_scripts`](super::lua_scripts)).
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking.

use super::{
    lua_scripts, Bounds, Condition, DeleteOutcome, IncrementOutcome, PutMode, PutOutcome, Record,
    StateStore, StoreError, UpdateOutcome, WindowCount,
};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, ErrorKind, RedisError, Script, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{error, instrument, warn};

/// Redis state store.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    put_script: Script,
    update_script: Script,
    increment_script: Script,
    delete_script: Script,
    window_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the client cannot be opened or
    /// the initial connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials
            error!(target: "bc.store.redis", error = %e, "Failed to open Redis client");
            StoreError::Unavailable(format!("failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "bc.store.redis", error = %e, "Failed to connect to Redis");
                StoreError::Unavailable(format!("failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            put_script: Script::new(lua_scripts::PUT_RECORD),
            update_script: Script::new(lua_scripts::CONDITIONAL_UPDATE),
            increment_script: Script::new(lua_scripts::CONDITIONAL_INCREMENT),
            delete_script: Script::new(lua_scripts::CONDITIONAL_DELETE),
            window_script: Script::new(lua_scripts::CONSUME_WINDOW),
        })
    }
}

/// Classify a redis-rs error.
fn map_redis_error(op: &'static str, key: &str, e: &RedisError) -> StoreError {
    warn!(
        target: "bc.store.redis",
        error = %e,
        op = op,
        key = %key,
        "Redis operation failed"
    );

    if e.is_timeout() {
        StoreError::Timeout
    } else if e.is_connection_refusal() {
        StoreError::Unavailable(e.to_string())
    } else if e.is_connection_dropped() || e.is_io_error() {
        StoreError::Interrupted(e.to_string())
    } else if matches!(
        e.kind(),
        ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::ClusterDown
    ) {
        StoreError::Throttled(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn int_value(value: &Value) -> Result<i64, StoreError> {
    ::redis::from_redis_value(value)
        .map_err(|e| StoreError::Corrupt(format!("expected integer reply: {e}")))
}

/// Split a `{status, field, value, ...}` script reply.
fn status_and_record(reply: &[Value]) -> Result<(i64, Record), StoreError> {
    let (status, rest) = reply
        .split_first()
        .ok_or_else(|| StoreError::Corrupt("empty script reply".to_string()))?;
    let status = int_value(status)?;

    let mut record = Record::new();
    for pair in rest.chunks(2) {
        if let [field, value] = pair {
            let field: String = ::redis::from_redis_value(field)
                .map_err(|e| StoreError::Corrupt(format!("bad field name: {e}")))?;
            let value: String = ::redis::from_redis_value(value)
                .map_err(|e| StoreError::Corrupt(format!("bad field value: {e}")))?;
            record.insert(field, value);
        } else {
            return Err(StoreError::Corrupt("odd field/value reply".to_string()));
        }
    }
    Ok((status, record))
}

fn push_conditions(invocation: &mut ::redis::ScriptInvocation<'_>, conditions: &[Condition]) {
    invocation.arg(conditions.len());
    for condition in conditions {
        invocation.arg(&condition.field).arg(&condition.value);
    }
}

#[async_trait]
impl StateStore for RedisStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| map_redis_error("get", key, &e))?;

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields.into_iter().collect()))
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn put(
        &self,
        key: &str,
        record: &Record,
        expires_at_secs: i64,
        mode: PutMode,
    ) -> Result<PutOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.put_script.key(key);
        invocation.arg(match mode {
            PutMode::Upsert => "upsert",
            PutMode::IfAbsent => "if_absent",
        });
        invocation.arg(expires_at_secs);
        for (field, value) in record {
            invocation.arg(field).arg(value);
        }

        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("put", key, &e))?;

        Ok(if written == 1 {
            PutOutcome::Written
        } else {
            PutOutcome::AlreadyExists
        })
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn update(
        &self,
        key: &str,
        fields: &Record,
        conditions: &[Condition],
    ) -> Result<UpdateOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.update_script.key(key);
        push_conditions(&mut invocation, conditions);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let reply: Vec<Value> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("update", key, &e))?;

        match status_and_record(&reply)? {
            (1, record) => Ok(UpdateOutcome::Applied(record)),
            (0, _) => Ok(UpdateOutcome::ConditionFailed),
            (-1, _) => Ok(UpdateOutcome::Missing),
            (other, _) => Err(StoreError::Corrupt(format!("update status {other}"))),
        }
    }

    #[instrument(skip_all, fields(key = %key, field = %field, delta = delta))]
    async fn increment(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        conditions: &[Condition],
        bounds: Bounds,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.increment_script.key(key);
        invocation
            .arg(field)
            .arg(delta)
            .arg(bounds.min.map(|v| v.to_string()).unwrap_or_default())
            .arg(bounds.max.map(|v| v.to_string()).unwrap_or_default());
        invocation.arg(conditions.len());
        for condition in conditions {
            invocation.arg(&condition.field).arg(&condition.value);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("increment", key, &e))?;

        match reply.as_slice() {
            [1, value] => Ok(IncrementOutcome::Applied(*value)),
            [0, _] => Ok(IncrementOutcome::ConditionFailed),
            [-1, _] => Ok(IncrementOutcome::Missing),
            [-2, current] => Ok(IncrementOutcome::OutOfBounds(*current)),
            other => Err(StoreError::Corrupt(format!("increment reply {other:?}"))),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(
        &self,
        key: &str,
        conditions: &[Condition],
    ) -> Result<DeleteOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.delete_script.key(key);
        push_conditions(&mut invocation, conditions);

        let reply: Vec<Value> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("delete", key, &e))?;

        match status_and_record(&reply)? {
            (1, record) => Ok(DeleteOutcome::Deleted(record)),
            (0, _) => Ok(DeleteOutcome::ConditionFailed),
            (-1, _) => Ok(DeleteOutcome::Missing),
            (other, _) => Err(StoreError::Corrupt(format!("delete status {other}"))),
        }
    }

    async fn index_add(
        &self,
        index: &str,
        member: &str,
        expires_at_secs: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic().cmd("SADD").arg(index).arg(member).ignore();
        if let Some(expires_at) = expires_at_secs {
            pipe.cmd("EXPIREAT").arg(index).arg(expires_at).ignore();
        }

        let () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("index_add", index, &e))?;
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .srem(index, member)
            .await
            .map_err(|e| map_redis_error("index_remove", index, &e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(index = %index))]
    async fn query_index(&self, index: &str) -> Result<Vec<(String, Record)>, StoreError> {
        let members = self.index_members(index).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let mut pipe = ::redis::pipe();
        for member in &members {
            pipe.cmd("HGETALL").arg(member);
        }
        let rows: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("query_index", index, &e))?;

        let mut live = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for (member, fields) in members.into_iter().zip(rows) {
            if fields.is_empty() {
                stale.push(member);
            } else {
                live.push((member, fields.into_iter().collect()));
            }
        }

        if !stale.is_empty() {
            let pruned: Result<i64, _> = conn.srem(index, &stale).await;
            if let Err(e) = pruned {
                warn!(
                    target: "bc.store.redis",
                    error = %e,
                    index = %index,
                    stale = stale.len(),
                    "Failed to prune expired index members"
                );
            }
        }

        Ok(live)
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        conn.smembers(index)
            .await
            .map_err(|e| map_redis_error("index_members", index, &e))
    }

    async fn score_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .zadd(index, member, score)
            .await
            .map_err(|e| map_redis_error("score_set", index, &e))?;
        Ok(())
    }

    async fn score_remove(&self, index: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .zrem(index, member)
            .await
            .map_err(|e| map_redis_error("score_remove", index, &e))?;
        Ok(())
    }

    async fn score_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.connection.clone();
        let flat: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(index)
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("score_range", index, &e))?;

        flat.chunks(2)
            .map(|pair| match pair {
                [member, score] => parse_score(score).map(|s| (member.clone(), s)),
                _ => Err(StoreError::Corrupt("odd ZRANGEBYSCORE reply".to_string())),
            })
            .collect()
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn consume_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        expires_at_secs: i64,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.window_script.key(key);
        invocation.arg(now_ms).arg(window_ms).arg(expires_at_secs);

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("consume_window", key, &e))?;

        match reply.as_slice() {
            [count, window_start_ms] => Ok(WindowCount {
                count: *count,
                window_start_ms: *window_start_ms,
            }),
            other => Err(StoreError::Corrupt(format!("window reply {other:?}"))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ping", "", &e))?;
        Ok(())
    }
}

fn parse_score(raw: &str) -> Result<i64, StoreError> {
    if let Ok(score) = raw.parse::<i64>() {
        return Ok(score);
    }
    // Redis may render large scores in exponent form
    raw.parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .map(|s| {
            #[allow(clippy::cast_possible_truncation)]
            let truncated = s as i64;
            truncated
        })
        .ok_or_else(|| StoreError::Corrupt(format!("bad score {raw}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_status_and_record_parses_pairs() {
        let reply = vec![
            Value::Int(1),
            bulk("isActive"),
            bulk("true"),
            bulk("listenerCount"),
            bulk("3"),
        ];

        let (status, record) = status_and_record(&reply).unwrap();

        assert_eq!(status, 1);
        assert_eq!(record.get("isActive").map(String::as_str), Some("true"));
        assert_eq!(record.get("listenerCount").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_status_and_record_rejects_odd_reply() {
        let reply = vec![Value::Int(1), bulk("orphan")];
        assert!(matches!(
            status_and_record(&reply),
            Err(StoreError::Corrupt(_))
        ));
        assert!(status_and_record(&[]).is_err());
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("1700000000000").unwrap(), 1_700_000_000_000);
        assert_eq!(parse_score("1.7e12").unwrap(), 1_700_000_000_000);
        assert!(parse_score("inf").is_err());
        assert!(parse_score("abc").is_err());
    }
}
