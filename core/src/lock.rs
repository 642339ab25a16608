//! Per-key mutual exclusion with bounded wait and automatic lease expiry.
//!
//! A holder that crashes or is partitioned away never blocks the key for longer than
//! its lease. Because a lease can run out while the holder is still working, holders
//! must not assume the lock is still theirs after the lease window: check
//! [`DistributedLock::is_held_by`] before committing work that depends on exclusivity.
//!
//! Ownership is an explicit [`LockOwner`] token rather than a thread identity, which
//! would be meaningless for async tasks migrating between worker threads.

use crate::types::PolicyId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during lock operations.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// Failed to reach the lock service
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Generic backend failure
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Name of a lockable resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(String);

impl LockKey {
    /// Create a lock key from an arbitrary name
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The admission lock for a policy
    #[must_use]
    pub fn for_policy(policy_id: PolicyId) -> Self {
        Self(format!("policy:{policy_id}"))
    }

    /// Borrow the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token identifying one lock holder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner(String);

impl LockOwner {
    /// A fresh random owner token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the token as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Distributed lock with lease-based expiry.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn DistributedLock>`.
pub trait DistributedLock: Send + Sync {
    /// Try to acquire `key` for `owner`, waiting at most `wait`.
    ///
    /// On success the lock is held until released or until `lease` elapses,
    /// whichever comes first. Returns `false` if the wait window elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock service is unreachable.
    fn try_acquire(
        &self,
        key: &LockKey,
        owner: &LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>>;

    /// Release `key` if `owner` still holds it.
    ///
    /// Releasing a lock that expired or belongs to someone else is a no-op, so this is
    /// safe to call on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock service is unreachable.
    fn release(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockError>> + Send + '_>>;

    /// Whether `owner` currently holds `key` (lease not yet expired).
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock service is unreachable.
    fn is_held_by(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>>;
}
