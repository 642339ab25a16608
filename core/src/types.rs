//! Domain types for the reservation engine.
//!
//! This module contains the identifiers, the resource policy, the transient reservation
//! intent, the durable reservation record with its state machine, and the short-lived
//! outcome record polled by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a resource policy (coupon policy, flash-sale item).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyId(i64);

impl PolicyId {
    /// Create a `PolicyId` from its numeric value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the party requesting a reservation.
///
/// Always passed explicitly through every call; there is no ambient "current requester".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequesterId(i64);

impl RequesterId {
    /// Create a `RequesterId` from its numeric value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the order a reservation was redeemed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(i64);

impl OrderId {
    /// Create an `OrderId` from its numeric value
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a durable reservation record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request id failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRequestId {
    /// The id was empty
    #[error("request id must not be empty")]
    Empty,

    /// The id exceeded [`RequestId::MAX_LEN`] characters
    #[error("request id must be at most {max} characters, got {len}")]
    TooLong {
        /// Maximum accepted length
        max: usize,
        /// Actual length
        len: usize,
    },

    /// The id contained whitespace
    #[error("request id must not contain whitespace")]
    Whitespace,
}

/// Caller-supplied idempotency key.
///
/// Deduplicates retried submissions at admission time and redelivered intents at
/// issuance time. Unique per `(policy, request id)` in the ledger.
///
/// Outcomes are looked up by request id alone, so ids are global: reusing one
/// against another policy replays the first policy's outcome instead of admitting
/// a new request. Callers must mint a fresh id per logical request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    /// Maximum accepted key length.
    pub const MAX_LEN: usize = 128;

    /// Validate and wrap a request id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRequestId`] if the id is empty, longer than
    /// [`RequestId::MAX_LEN`] characters, or contains whitespace.
    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidRequestId> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvalidRequestId::Empty);
        }
        let len = value.chars().count();
        if len > Self::MAX_LEN {
            return Err(InvalidRequestId::TooLong {
                max: Self::MAX_LEN,
                len,
            });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(InvalidRequestId::Whitespace);
        }
        Ok(Self(value))
    }

    /// Borrow the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = InvalidRequestId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Resource Policy
// ============================================================================

/// Configuration describing a scarce resource: total quantity and active window.
///
/// Owned by the policy store; read-only from the engine's perspective.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// Policy identifier
    pub id: PolicyId,
    /// Human-readable name
    pub name: String,
    /// Total number of units that may ever be issued
    pub total_quantity: u32,
    /// Start of the issuance window (inclusive)
    pub valid_from: DateTime<Utc>,
    /// End of the issuance window (inclusive)
    pub valid_until: DateTime<Utc>,
}

impl ResourcePolicy {
    /// Whether `now` falls inside the policy's validity window.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now <= self.valid_until
    }
}

// ============================================================================
// Reservation Intent
// ============================================================================

/// An accepted-but-not-yet-durable reservation, carried by the issuance queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationIntent {
    /// Idempotency key supplied by the caller
    pub request_id: RequestId,
    /// Policy the units were taken from
    pub policy_id: PolicyId,
    /// Who the units are reserved for
    pub requester_id: RequesterId,
    /// Number of units admitted
    pub quantity: u32,
    /// When the coordinator admitted the request
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// Reservation Record
// ============================================================================

/// Status of a durable reservation record.
///
/// ```text
/// Available ──► Used ──► Cancelled
///
/// Reserved ──► Available
///     └──────► Cancelled
///
/// Rejected (terminal, never persisted)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Issued and redeemable
    Available,
    /// Held pending confirmation
    Reserved,
    /// Redeemed against an order
    Used,
    /// Redemption was reversed
    Cancelled,
    /// Admission was refused
    Rejected,
}

impl ReservationStatus {
    /// Whether a record may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Available, Self::Used)
                | (Self::Used, Self::Cancelled)
                | (Self::Reserved, Self::Available | Self::Cancelled)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Rejected)
    }

    /// Whether the record still counts against the policy's total quantity.
    #[must_use]
    pub const fn consumes_inventory(self) -> bool {
        !matches!(self, Self::Rejected)
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::Used => "USED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(Self::Available),
            "RESERVED" => Some(Self::Reserved),
            "USED" => Some(Self::Used),
            "CANCELLED" => Some(Self::Cancelled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a resource code: 12 upper-case hexadecimal characters.
#[must_use]
pub fn generate_resource_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(12)
        .collect::<String>()
        .to_uppercase()
}

/// The durable unit of truth: one issued reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// Record identifier
    pub id: ReservationId,
    /// Policy the units belong to
    pub policy_id: PolicyId,
    /// Idempotency key of the admission that produced this record
    pub request_id: RequestId,
    /// Owner of the reservation
    pub requester_id: RequesterId,
    /// Redeemable code handed to the requester
    pub resource_code: String,
    /// Units consumed by this reservation
    pub quantity: u32,
    /// Current lifecycle status
    pub status: ReservationStatus,
    /// Order the reservation was redeemed against
    pub order_id: Option<OrderId>,
    /// When the reservation was redeemed
    pub used_at: Option<DateTime<Utc>>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl ReservationRecord {
    /// Build a fresh `Available` record for an admitted intent.
    #[must_use]
    pub fn issue(intent: &ReservationIntent, now: DateTime<Utc>) -> Self {
        Self {
            id: ReservationId::new(),
            policy_id: intent.policy_id,
            request_id: intent.request_id.clone(),
            requester_id: intent.requester_id,
            resource_code: generate_resource_code(),
            quantity: intent.quantity,
            status: ReservationStatus::Available,
            order_id: None,
            used_at: None,
            created_at: now,
        }
    }
}

// ============================================================================
// Outcome Record
// ============================================================================

/// Processing state of an admitted request, as seen by pollers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    /// Admitted, not yet durable
    Pending,
    /// A reservation record exists
    Success,
    /// The request will not produce a record
    Failure,
}

/// Why a request ended in [`OutcomeStatus::Failure`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Inventory was gone
    Exhausted,
    /// The policy window was closed
    OutOfWindow,
    /// The policy does not exist
    PolicyNotFound,
    /// The durable write failed after retries
    PersistenceFailure {
        /// Operator-facing detail
        detail: String,
    },
}

impl FailureReason {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Exhausted => "EXHAUSTED",
            Self::OutOfWindow => "OUT_OF_WINDOW",
            Self::PolicyNotFound => "POLICY_NOT_FOUND",
            Self::PersistenceFailure { .. } => "PERSISTENCE_FAILURE",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PersistenceFailure { detail } => write!(f, "PERSISTENCE_FAILURE: {detail}"),
            other => f.write_str(other.code()),
        }
    }
}

/// Short-lived record mapping a request id to its processing state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Idempotency key of the request
    pub request_id: RequestId,
    /// Current state
    pub status: OutcomeStatus,
    /// Issued reservation, set on success
    pub reservation_id: Option<ReservationId>,
    /// Failure cause, set on failure
    pub reason: Option<FailureReason>,
    /// When this state was written
    pub updated_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// A freshly claimed request.
    #[must_use]
    pub const fn pending(request_id: RequestId, now: DateTime<Utc>) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::Pending,
            reservation_id: None,
            reason: None,
            updated_at: now,
        }
    }

    /// A request that produced a reservation record.
    #[must_use]
    pub const fn success(
        request_id: RequestId,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::Success,
            reservation_id: Some(reservation_id),
            reason: None,
            updated_at: now,
        }
    }

    /// A request that will never produce a record.
    #[must_use]
    pub const fn failure(request_id: RequestId, reason: FailureReason, now: DateTime<Utc>) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::Failure,
            reservation_id: None,
            reason: Some(reason),
            updated_at: now,
        }
    }

    /// Whether this state is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.status, OutcomeStatus::Pending)
    }
}
