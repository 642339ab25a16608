//! Redis-backed lock service.
//!
//! # Algorithm
//!
//! 1. Acquire: `SET key owner NX PX lease`, polled until the wait window closes
//! 2. Check: `GET key == owner`
//! 3. Release: compare-and-delete in Lua, so an expired holder cannot delete the key
//!    after someone else acquired it

use crate::{expiry_millis, is_unreachable};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use reservation_core::lock::{DistributedLock, LockError, LockKey, LockOwner};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

const RELEASE_IF_OWNER: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
";

/// `Redis` lock with lease expiry.
#[derive(Clone)]
pub struct RedisLock {
    conn_manager: ConnectionManager,
    release: Script,
    poll_interval: Duration,
}

impl RedisLock {
    /// Create a lock service polling every 25ms while waiting.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            release: Script::new(RELEASE_IF_OWNER),
            poll_interval: Duration::from_millis(25),
        }
    }

    /// Set how often a waiting acquire retries.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lock_key(key: &LockKey) -> String {
        format!("reservation:lock:{key}")
    }

    async fn try_set(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(expiry_millis(lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| lock_error(&e))?;
        Ok(set.is_some())
    }
}

fn lock_error(error: &RedisError) -> LockError {
    if is_unreachable(error) {
        LockError::ConnectionFailed(error.to_string())
    } else {
        LockError::Backend(error.to_string())
    }
}

impl DistributedLock for RedisLock {
    fn try_acquire(
        &self,
        key: &LockKey,
        owner: &LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        let key = Self::lock_key(key);
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            let deadline = Instant::now() + wait;
            loop {
                if self.try_set(&key, &owner, lease).await? {
                    tracing::trace!(%key, %owner, "Lock acquired");
                    return Ok(true);
                }
                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!(%key, wait_ms = wait.as_millis(), "Lock wait elapsed");
                    return Ok(false);
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn release(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockError>> + Send + '_>> {
        let key = Self::lock_key(key);
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let deleted: i64 = self
                .release
                .key(&key)
                .arg(&owner)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| lock_error(&e))?;
            if deleted == 0 {
                tracing::debug!(%key, %owner, "Lock already expired or taken over at release");
            }
            Ok(())
        })
    }

    fn is_held_by(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        let key = Self::lock_key(key);
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let current: Option<String> = conn.get(&key).await.map_err(|e| lock_error(&e))?;
            Ok(current.as_deref() == Some(owner.as_str()))
        })
    }
}
