//! Redis-backed shared counter.

use crate::{expiry_millis, is_unreachable};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use reservation_core::PolicyId;
use reservation_core::counter::{AtomicQuantityCache, CounterError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Apply a delta only to an existing key.
///
/// A plain `DECRBY` on a missing key would create it at `-n`, silently re-opening an
/// expired or never-activated policy.
const ADJUST_EXISTING: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 0 then
        return false
    end
    return redis.call('INCRBY', KEYS[1], ARGV[1])
";

/// `Redis` counter, one integer key per policy.
///
/// Keys are `reservation:counter:{policy_id}` and expire with the policy window when
/// initialized with a TTL.
#[derive(Clone)]
pub struct RedisQuantityCache {
    conn_manager: ConnectionManager,
    adjust: Script,
}

impl RedisQuantityCache {
    /// Create a counter on an existing connection.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            adjust: Script::new(ADJUST_EXISTING),
        }
    }

    fn counter_key(policy_id: PolicyId) -> String {
        format!("reservation:counter:{policy_id}")
    }

    async fn adjust(&self, policy_id: PolicyId, delta: i64) -> Result<i64, CounterError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<i64> = self
            .adjust
            .key(Self::counter_key(policy_id))
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| counter_error(policy_id, &e))?;
        value.ok_or(CounterError::NotInitialized(policy_id))
    }
}

fn counter_error(policy_id: PolicyId, error: &RedisError) -> CounterError {
    if is_unreachable(error) {
        CounterError::ConnectionFailed(error.to_string())
    } else if error.kind() == redis::ErrorKind::TypeError
        || error.kind() == redis::ErrorKind::ResponseError
    {
        CounterError::Corrupted {
            policy_id,
            reason: error.to_string(),
        }
    } else {
        CounterError::Backend(error.to_string())
    }
}

impl AtomicQuantityCache for RedisQuantityCache {
    fn initialize(
        &self,
        policy_id: PolicyId,
        value: i64,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CounterError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let mut cmd = redis::cmd("SET");
            cmd.arg(Self::counter_key(policy_id)).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(expiry_millis(ttl));
            }
            let set: Option<String> = cmd
                .query_async(&mut conn)
                .await
                .map_err(|e| counter_error(policy_id, &e))?;

            let created = set.is_some();
            tracing::info!(%policy_id, value, created, "Counter initialized");
            Ok(created)
        })
    }

    fn decrement_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>> {
        Box::pin(self.adjust(policy_id, -n))
    }

    fn increment_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>> {
        Box::pin(self.adjust(policy_id, n))
    }

    fn get(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let value: Option<i64> = conn
                .get(Self::counter_key(policy_id))
                .await
                .map_err(|e| counter_error(policy_id, &e))?;
            Ok(value)
        })
    }
}
