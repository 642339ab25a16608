//! Shared atomic quantity counter.
//!
//! The counter is the single source of truth for "how many units remain right now".
//! It must be atomic across every process that admits requests, so implementations sit
//! on shared infrastructure (Redis in production).
//!
//! # Decrement-then-check
//!
//! Callers never read the counter and then write it. Admission decrements first and
//! inspects the post-decrement value:
//!
//! ```text
//! remaining = decrement_and_get(policy, n)
//! if remaining < 0 {
//!     increment_and_get(policy, n)   // compensate before acting
//!     return Exhausted
//! }
//! ```
//!
//! The decrement itself is the serialization point, so no lost update is possible even
//! if two admissions race past the lock.

use crate::types::PolicyId;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during counter operations.
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// Failed to reach the counter backend
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The counter key does not exist (policy not activated or expired)
    #[error("Counter for policy {0} is not initialized")]
    NotInitialized(PolicyId),

    /// The stored value is not an integer
    #[error("Counter for policy {policy_id} holds a non-integer value: {reason}")]
    Corrupted {
        /// The policy whose counter is unreadable
        policy_id: PolicyId,
        /// Backend detail
        reason: String,
    },

    /// Generic backend failure
    #[error("Counter backend error: {0}")]
    Backend(String),
}

/// Externally shared per-policy counter with atomic increment and decrement.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn AtomicQuantityCache>`.
pub trait AtomicQuantityCache: Send + Sync {
    /// Create the counter for a policy with an initial value.
    ///
    /// Idempotent: when the counter already exists it is left untouched and `false`
    /// is returned, so an in-flight counter is never reset.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError`] if the backend is unreachable.
    fn initialize(
        &self,
        policy_id: PolicyId,
        value: i64,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CounterError>> + Send + '_>>;

    /// Atomically subtract `n` and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError::NotInitialized`] if the counter does not exist.
    fn decrement_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>>;

    /// Atomically add `n` and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError::NotInitialized`] if the counter does not exist.
    fn increment_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>>;

    /// Current value, for observability only. Never use it to make admission decisions.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError`] if the backend is unreachable.
    fn get(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterError>> + Send + '_>>;
}
