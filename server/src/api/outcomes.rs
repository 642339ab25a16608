//! Outcome polling endpoints.
//!
//! - GET /api/outcomes/:request_id - Current outcome of an admitted request
//! - POST /api/outcomes/:request_id/recover - Reconcile a lost outcome with the ledger

use crate::api::reservations::ReservationView;
use crate::error::AppError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use reservation_core::{PolicyId, RequestId};
use reservation_runtime::{PollStatus, Recovery};
use serde::{Deserialize, Serialize};

/// Request body for recovery.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverRequest {
    /// Policy the lost request was made against
    pub policy_id: i64,
}

/// Recovery verdict.
#[derive(Debug, Serialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryResponse {
    /// The old request produced this reservation; do not resubmit
    Recovered {
        /// The reservation
        reservation: ReservationView,
    },
    /// Nothing was issued; resubmitting with the same request id is safe
    SafeToResubmit,
}

fn parse_request_id(raw: String) -> Result<RequestId, AppError> {
    RequestId::parse(raw).map_err(|e| AppError::bad_request(e.to_string()))
}

/// Current outcome of a request.
///
/// `200` with `PENDING`, `SUCCESS` or `FAILURE`; `404` with `NOT_FOUND` for an
/// unknown or expired request id.
///
/// # Errors
///
/// Returns [`AppError`] if the result store is unreachable.
pub async fn get_outcome(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<(StatusCode, Json<PollStatus>), AppError> {
    let request_id = parse_request_id(request_id)?;
    let status = state.poller.poll(&request_id).await?;
    let code = if status == PollStatus::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    Ok((code, Json(status)))
}

/// Decide whether a request whose outcome went missing may be resubmitted.
///
/// # Errors
///
/// Returns [`AppError`] if the ledger is unreachable; the caller must not
/// resubmit then.
pub async fn recover(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<RecoverRequest>,
) -> Result<Json<RecoveryResponse>, AppError> {
    let request_id = parse_request_id(request_id)?;
    let verdict = state
        .poller
        .recover(PolicyId::new(body.policy_id), &request_id)
        .await?;

    Ok(Json(match verdict {
        Recovery::Recovered(record) => RecoveryResponse::Recovered {
            reservation: record.into(),
        },
        Recovery::SafeToResubmit => RecoveryResponse::SafeToResubmit,
    }))
}
