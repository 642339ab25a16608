//! The tagged result of an admission decision.
//!
//! Expected rejections (inventory gone, window closed, lock contention) are values,
//! not errors. Infrastructure faults are reported separately by the coordinator.

use crate::types::{FailureReason, RequestId, ReservationId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an admission was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The policy lock could not be acquired within the wait window. Retryable.
    LockBusy,
    /// The policy's validity window does not contain the current time.
    OutOfWindow,
    /// No units remain.
    Exhausted,
    /// The policy does not exist.
    PolicyNotFound,
    /// The requested quantity was zero.
    InvalidQuantity,
}

impl RejectReason {
    /// Whether the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::LockBusy)
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::LockBusy => "LOCK_BUSY",
            Self::OutOfWindow => "OUT_OF_WINDOW",
            Self::Exhausted => "EXHAUSTED",
            Self::PolicyNotFound => "POLICY_NOT_FOUND",
            Self::InvalidQuantity => "INVALID_QUANTITY",
        }
    }

    /// The failure recorded for pollers when a claimed request is rejected.
    ///
    /// Retryable rejections have no terminal failure.
    #[must_use]
    pub const fn as_failure(self) -> Option<FailureReason> {
        match self {
            Self::OutOfWindow => Some(FailureReason::OutOfWindow),
            Self::Exhausted => Some(FailureReason::Exhausted),
            Self::PolicyNotFound => Some(FailureReason::PolicyNotFound),
            Self::LockBusy | Self::InvalidQuantity => None,
        }
    }

    /// Recover the admission rejection recorded in a failed outcome, if any.
    #[must_use]
    pub const fn from_failure(reason: &FailureReason) -> Option<Self> {
        match reason {
            FailureReason::Exhausted => Some(Self::Exhausted),
            FailureReason::OutOfWindow => Some(Self::OutOfWindow),
            FailureReason::PolicyNotFound => Some(Self::PolicyNotFound),
            FailureReason::PersistenceFailure { .. } => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An accepted admission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    /// Token the caller polls with
    pub request_id: RequestId,
    /// Set when the record was written synchronously
    pub reservation_id: Option<ReservationId>,
    /// Whether this request id had already been admitted
    pub replayed: bool,
}

/// Result of an admission decision.
///
/// `Accepted` is not a guarantee of final success on the asynchronous path; the
/// outcome must be polled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    /// Units were taken (or the request was already admitted)
    Accepted(Acceptance),
    /// The request was refused
    Rejected(RejectReason),
}

impl Admission {
    /// Whether units were admitted.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// The rejection reason, if rejected.
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            Self::Accepted(_) => None,
        }
    }
}
