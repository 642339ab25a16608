//! Redis-backed outcome records.
//!
//! Records are stored as JSON under `reservation:outcome:{request_id}`. Write-once
//! semantics for terminal states are enforced server-side in Lua; the scripts read
//! the `status` field of the stored JSON with `cjson`.

use crate::{expiry_millis, is_unreachable};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use reservation_core::outcome::{ResultStore, ResultStoreError};
use reservation_core::{OutcomeRecord, RequestId};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Returns the stored record when one exists, otherwise stores ARGV[1] and returns nil.
const CLAIM: &str = r"
    local existing = redis.call('GET', KEYS[1])
    if existing then
        return existing
    end
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return false
";

/// Stores ARGV[1] unless a terminal record is already stored; returns what is stored.
const COMPLETE: &str = r"
    local existing = redis.call('GET', KEYS[1])
    if existing and cjson.decode(existing)['status'] ~= 'PENDING' then
        return existing
    end
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return ARGV[1]
";

const ABANDON: &str = r"
    local existing = redis.call('GET', KEYS[1])
    if existing and cjson.decode(existing)['status'] == 'PENDING' then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// `Redis` result store.
#[derive(Clone)]
pub struct RedisResultStore {
    conn_manager: ConnectionManager,
    claim: Script,
    complete: Script,
    abandon: Script,
}

impl RedisResultStore {
    /// Create a result store on an existing connection.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            claim: Script::new(CLAIM),
            complete: Script::new(COMPLETE),
            abandon: Script::new(ABANDON),
        }
    }

    fn outcome_key(request_id: &RequestId) -> String {
        format!("reservation:outcome:{request_id}")
    }
}

fn store_error(error: &RedisError) -> ResultStoreError {
    if is_unreachable(error) {
        ResultStoreError::ConnectionFailed(error.to_string())
    } else {
        ResultStoreError::Backend(error.to_string())
    }
}

fn encode(record: &OutcomeRecord) -> Result<String, ResultStoreError> {
    serde_json::to_string(record).map_err(|e| ResultStoreError::Serialization(e.to_string()))
}

fn decode(json: &str) -> Result<OutcomeRecord, ResultStoreError> {
    serde_json::from_str(json).map_err(|e| ResultStoreError::Serialization(e.to_string()))
}

impl ResultStore for RedisResultStore {
    fn claim(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>
    {
        let key = Self::outcome_key(&record.request_id);
        let json = encode(record);
        Box::pin(async move {
            let json = json?;
            let mut conn = self.conn_manager.clone();
            let existing: Option<String> = self
                .claim
                .key(&key)
                .arg(json)
                .arg(expiry_millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            existing.as_deref().map(decode).transpose()
        })
    }

    fn complete(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<OutcomeRecord, ResultStoreError>> + Send + '_>> {
        let key = Self::outcome_key(&record.request_id);
        let json = encode(record);
        Box::pin(async move {
            let json = json?;
            let mut conn = self.conn_manager.clone();
            let stored: String = self
                .complete
                .key(&key)
                .arg(json)
                .arg(expiry_millis(ttl))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            decode(&stored)
        })
    }

    fn abandon(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResultStoreError>> + Send + '_>> {
        let key = Self::outcome_key(request_id);
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: i64 = self
                .abandon
                .key(&key)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| store_error(&e))?;
            Ok(())
        })
    }

    fn get(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>
    {
        let key = Self::outcome_key(request_id);
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let stored: Option<String> = conn.get(&key).await.map_err(|e| store_error(&e))?;
            stored.as_deref().map(decode).transpose()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reservation_core::{DateTime, ReservationId, Utc};

    #[test]
    fn lua_scripts_read_the_serialized_status_field() {
        let record = OutcomeRecord::pending(RequestId::parse("r").unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        let json: serde_json::Value = serde_json::from_str(&encode(&record).unwrap()).unwrap();
        assert_eq!(json["status"], "PENDING");

        let success = OutcomeRecord::success(
            RequestId::parse("r").unwrap(),
            ReservationId::new(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        assert_eq!(decode(&encode(&success).unwrap()).unwrap(), success);
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(
            RedisResultStore::outcome_key(&RequestId::parse("abc").unwrap()),
            "reservation:outcome:abc"
        );
    }
}
