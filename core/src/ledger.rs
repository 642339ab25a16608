//! Durable reservation ledger.
//!
//! The ledger is the unit of truth for issued reservations. Whatever the admission
//! strategy, one invariant holds here:
//!
//! ```text
//! Σ quantity of records with status ∈ {Available, Reserved, Used, Cancelled}
//!     ≤ policy.total_quantity
//! ```
//!
//! # Idempotent inserts
//!
//! Records are unique per `(policy_id, request_id)`. [`PersistentLedger::insert_if_absent`]
//! reports a duplicate as [`InsertOutcome::AlreadyExists`] carrying the stored record, so
//! a redelivered intent resolves to the reservation its first delivery created.
//!
//! # Implementations
//!
//! - `PostgresLedger` (reservation-postgres): Production implementation
//! - `InMemoryLedger` (reservation-testing): Fast, deterministic testing

use crate::types::{
    OrderId, PolicyId, RequestId, RequesterId, ReservationId, ReservationRecord,
    ReservationStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Database connection error. Transient.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No record with the given id.
    #[error("Reservation not found: {0}")]
    NotFound(ReservationId),

    /// The record was not in the expected status when the update ran.
    #[error("Reservation {id} is {actual}, expected {expected}")]
    StatusConflict {
        /// The record
        id: ReservationId,
        /// Status the update required
        expected: ReservationStatus,
        /// Status actually stored
        actual: ReservationStatus,
    },

    /// A stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other database error.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl LedgerError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::DatabaseError(_))
    }
}

/// Result of [`PersistentLedger::insert_if_absent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was written
    Inserted(ReservationRecord),
    /// A record for the same `(policy, request id)` already existed; this is it
    AlreadyExists(ReservationRecord),
}

impl InsertOutcome {
    /// The record that is stored, whichever way the insert went.
    #[must_use]
    pub fn into_record(self) -> ReservationRecord {
        match self {
            Self::Inserted(record) | Self::AlreadyExists(record) => record,
        }
    }
}

/// A compare-and-set status change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Status the record must currently have
    pub expected: ReservationStatus,
    /// Status to move to
    pub next: ReservationStatus,
    /// Order to record (cleared when `None`)
    pub order_id: Option<OrderId>,
    /// Redemption time to record (cleared when `None`)
    pub used_at: Option<DateTime<Utc>>,
}

/// Zero-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Page number, starting at 0
    pub number: u32,
    /// Records per page
    pub size: u32,
}

impl Page {
    /// Largest accepted page size.
    pub const MAX_SIZE: u32 = 100;

    /// Build a page request, clamping the size to `1..=MAX_SIZE`.
    #[must_use]
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    /// Number of records to skip.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.number) * u64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 10)
    }
}

/// Durable store of reservation records.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn PersistentLedger>`.
pub trait PersistentLedger: Send + Sync {
    /// Insert `record` unless one exists for its `(policy_id, request_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    fn insert_if_absent(
        &self,
        record: &ReservationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, LedgerError>> + Send + '_>>;

    /// Load a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the read fails.
    fn find_by_id(
        &self,
        id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>;

    /// Load the record produced by a request.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the read fails.
    fn find_by_request(
        &self,
        policy_id: PolicyId,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>;

    /// Atomically apply `change` if the record is in `change.expected`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] for an unknown id and
    /// [`LedgerError::StatusConflict`] when the stored status differs.
    fn update_status(
        &self,
        id: ReservationId,
        change: StatusChange,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationRecord, LedgerError>> + Send + '_>>;

    /// Sum of `quantity` over records that consume inventory for a policy.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the read fails.
    fn active_units(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>>;

    /// A requester's records, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the read fails.
    fn list_by_requester(
        &self,
        requester_id: RequesterId,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>;
}
