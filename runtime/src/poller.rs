//! Polling contract for admitted requests.
//!
//! After `ACCEPTED` the caller polls the outcome by request id. `NotFound` after the
//! expected processing window means the request may be lost; before resubmitting with
//! a fresh request id the caller must [`OutcomePoller::recover`], which asks the ledger
//! whether the old request already produced a record (a slow but alive worker).

use crate::backends::Backends;
use reservation_core::ledger::LedgerError;
use reservation_core::outcome::ResultStoreError;
use reservation_core::{
    FailureReason, OutcomeRecord, OutcomeStatus, PolicyId, RequestId, ReservationId,
    ReservationRecord,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Errors while polling or recovering.
#[derive(Error, Debug)]
pub enum PollError {
    /// The result store failed
    #[error("result store: {0}")]
    Results(#[from] ResultStoreError),

    /// The ledger failed
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// What a poll observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
    /// Admitted, not yet durable
    Pending,
    /// The reservation exists
    Success {
        /// The issued reservation
        #[serde(rename = "reservationId")]
        reservation_id: ReservationId,
    },
    /// The request will not produce a reservation
    Failure {
        /// Why
        reason: FailureReason,
    },
    /// Unknown or expired request id
    NotFound,
}

impl PollStatus {
    /// Whether polling can stop.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failure { .. })
    }
}

impl From<OutcomeRecord> for PollStatus {
    fn from(record: OutcomeRecord) -> Self {
        match (record.status, record.reservation_id, record.reason) {
            (OutcomeStatus::Success, Some(reservation_id), _) => Self::Success { reservation_id },
            (OutcomeStatus::Failure, _, Some(reason)) => Self::Failure { reason },
            // A terminal record missing its payload is treated as still in flight.
            _ => Self::Pending,
        }
    }
}

/// Verdict of a recovery check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// The old request produced this record; do not resubmit
    Recovered(ReservationRecord),
    /// No record exists for the old request id
    SafeToResubmit,
}

/// Reads outcomes and reconciles lost ones against the ledger.
#[derive(Clone, Debug)]
pub struct OutcomePoller {
    backends: Backends,
    outcome_ttl: Duration,
}

impl OutcomePoller {
    /// Create a poller. Recovered outcomes are republished with `outcome_ttl`.
    #[must_use]
    pub const fn new(backends: Backends, outcome_ttl: Duration) -> Self {
        Self {
            backends,
            outcome_ttl,
        }
    }

    /// Current outcome of a request.
    ///
    /// # Errors
    ///
    /// Returns [`PollError`] if the result store is unreachable.
    pub async fn poll(&self, request_id: &RequestId) -> Result<PollStatus, PollError> {
        Ok(self
            .backends
            .results
            .get(request_id)
            .await?
            .map_or(PollStatus::NotFound, PollStatus::from))
    }

    /// Poll every `interval` until the outcome is terminal or `deadline` has passed.
    ///
    /// Returns the last observed status, which is non-terminal on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PollError`] if the result store is unreachable.
    pub async fn wait_for_terminal(
        &self,
        request_id: &RequestId,
        interval: Duration,
        deadline: Duration,
    ) -> Result<PollStatus, PollError> {
        let give_up_at = Instant::now() + deadline;
        loop {
            let status = self.poll(request_id).await?;
            if status.is_terminal() || Instant::now() + interval > give_up_at {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Decide whether a request whose outcome went missing may be resubmitted.
    ///
    /// # Errors
    ///
    /// Returns [`PollError`] if the ledger is unreachable. Do not resubmit then.
    pub async fn recover(
        &self,
        policy_id: PolicyId,
        request_id: &RequestId,
    ) -> Result<Recovery, PollError> {
        let Some(record) = self
            .backends
            .ledger
            .find_by_request(policy_id, request_id)
            .await?
        else {
            info!(%policy_id, %request_id, "No record for request, safe to resubmit");
            return Ok(Recovery::SafeToResubmit);
        };

        let success =
            OutcomeRecord::success(request_id.clone(), record.id, self.backends.clock.now());
        if let Err(e) = self.backends.results.complete(&success, self.outcome_ttl).await {
            warn!(%request_id, error = %e, "Failed to republish recovered outcome");
        }
        info!(%policy_id, %request_id, reservation_id = %record.id, "Recovered reservation");
        Ok(Recovery::Recovered(record))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn outcome_conversion() {
        let id = RequestId::parse("r").unwrap();
        let reservation_id = ReservationId::new();
        assert_eq!(
            PollStatus::from(OutcomeRecord::pending(id.clone(), Utc::now())),
            PollStatus::Pending
        );
        assert_eq!(
            PollStatus::from(OutcomeRecord::success(id.clone(), reservation_id, Utc::now())),
            PollStatus::Success { reservation_id }
        );
        assert_eq!(
            PollStatus::from(OutcomeRecord::failure(id, FailureReason::Exhausted, Utc::now())),
            PollStatus::Failure {
                reason: FailureReason::Exhausted
            }
        );
    }

    #[test]
    fn poll_status_wire_format() {
        let json = serde_json::to_value(PollStatus::Failure {
            reason: FailureReason::OutOfWindow,
        })
        .unwrap();
        assert_eq!(json["status"], "FAILURE");
        assert_eq!(json["reason"]["code"], "OUT_OF_WINDOW");
        assert_eq!(
            serde_json::to_value(PollStatus::NotFound).unwrap()["status"],
            "NOT_FOUND"
        );
    }
}
