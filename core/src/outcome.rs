//! Short-lived request outcome storage.
//!
//! Every admitted request id maps to an [`OutcomeRecord`] that callers poll. The store
//! doubles as the admission-level idempotency guard: [`ResultStore::claim`] is a
//! set-if-absent, so a retried submission finds the earlier claim instead of taking
//! units a second time.
//!
//! Terminal outcomes are write-once. [`ResultStore::complete`] never overwrites a
//! `Success` or `Failure` that is already stored; it returns the stored record so the
//! caller can observe which write won. A `Pending` claim can be withdrawn with
//! [`ResultStore::abandon`] when admission fails after claiming.

use crate::types::{OutcomeRecord, RequestId};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during result store operations.
#[derive(Error, Debug, Clone)]
pub enum ResultStoreError {
    /// Failed to reach the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A stored record could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic backend failure
    #[error("Result store backend error: {0}")]
    Backend(String),
}

/// Key-value store of request outcomes with expiry.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn ResultStore>`.
pub trait ResultStore: Send + Sync {
    /// Store `record` (normally `Pending`) only if nothing is stored for its request id.
    ///
    /// Returns `None` when the claim was taken, or the record already stored.
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError`] if the store is unreachable.
    fn claim(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>;

    /// Write a terminal outcome unless a terminal outcome is already stored.
    ///
    /// Returns the record that is stored after the call: `record` itself, or the
    /// earlier terminal outcome that won.
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError`] if the store is unreachable.
    fn complete(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<OutcomeRecord, ResultStoreError>> + Send + '_>>;

    /// Remove a `Pending` claim so the request id can be submitted again.
    ///
    /// Terminal records are left in place.
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError`] if the store is unreachable.
    fn abandon(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResultStoreError>> + Send + '_>>;

    /// Look up the outcome for a request id. `None` when unknown or expired.
    ///
    /// # Errors
    ///
    /// Returns [`ResultStoreError`] if the store is unreachable.
    fn get(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>;
}
