//! Reservation API endpoints.
//!
//! - POST /api/reservations - Admit a reservation request
//! - POST /api/reservations/:id/use - Redeem a reservation against an order
//! - POST /api/reservations/:id/cancel - Reverse a redemption
//! - GET /api/requesters/:id/reservations - List a requester's reservations
//!
//! # Admission
//!
//! A `202 Accepted` means units were taken. On the asynchronous path the record
//! is written later; poll `/api/outcomes/:request_id` for the reservation id.

use crate::error::AppError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use reservation_core::ledger::Page;
use reservation_core::{
    Admission, DateTime, OrderId, PolicyId, RequestId, RequesterId, ReservationId,
    ReservationRecord, ReservationStatus, Utc,
};
use reservation_runtime::ReserveRequest;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to reserve units of a policy.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationRequest {
    /// Policy to draw from
    pub policy_id: i64,
    /// Who the reservation is for
    pub requester_id: i64,
    /// Units requested
    pub quantity: u32,
    /// Caller-chosen idempotency key
    pub request_id: String,
}

/// Response to an accepted admission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Token to poll with
    pub request_id: RequestId,
    /// Present when the record was written synchronously
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    /// Whether this request id had already been admitted
    pub replayed: bool,
}

/// Request to redeem a reservation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseReservationRequest {
    /// Caller; must own the reservation
    pub requester_id: i64,
    /// Order the reservation is applied to
    pub order_id: i64,
}

/// Request to cancel a redemption.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    /// Caller; must own the reservation
    pub requester_id: i64,
}

/// Query parameters for listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Status filter (`AVAILABLE`, `USED`, ...)
    pub status: Option<String>,
    /// Page number, starting at 0
    pub page: Option<u32>,
    /// Page size, clamped to `1..=100`
    pub size: Option<u32>,
}

/// A reservation as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    /// Reservation ID
    pub id: ReservationId,
    /// Policy the units belong to
    pub policy_id: PolicyId,
    /// Request that produced it
    pub request_id: RequestId,
    /// Owner
    pub requester_id: RequesterId,
    /// Redeemable code
    pub resource_code: String,
    /// Units held
    pub quantity: u32,
    /// Current status
    pub status: ReservationStatus,
    /// Order it was redeemed against
    pub order_id: Option<OrderId>,
    /// When it was redeemed
    pub used_at: Option<DateTime<Utc>>,
    /// When it was issued
    pub created_at: DateTime<Utc>,
}

impl From<ReservationRecord> for ReservationView {
    fn from(record: ReservationRecord) -> Self {
        Self {
            id: record.id,
            policy_id: record.policy_id,
            request_id: record.request_id,
            requester_id: record.requester_id,
            resource_code: record.resource_code,
            quantity: record.quantity,
            status: record.status,
            order_id: record.order_id,
            used_at: record.used_at,
            created_at: record.created_at,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Admit a reservation request.
///
/// Returns `202` with the polling token, or the rejection as a `4xx`
/// (`429` with `Retry-After` when the policy lock is busy).
///
/// # Errors
///
/// Returns [`AppError`] for an invalid request id, a rejection, or an
/// infrastructure fault (503).
pub async fn reserve(
    State(state): State<AppState>,
    Json(body): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<AdmissionResponse>), AppError> {
    let request_id =
        RequestId::parse(body.request_id).map_err(|e| AppError::bad_request(e.to_string()))?;

    let admission = state
        .coordinator
        .reserve(ReserveRequest {
            policy_id: PolicyId::new(body.policy_id),
            requester_id: RequesterId::new(body.requester_id),
            quantity: body.quantity,
            request_id,
        })
        .await?;

    match admission {
        Admission::Accepted(acceptance) => Ok((
            StatusCode::ACCEPTED,
            Json(AdmissionResponse {
                request_id: acceptance.request_id,
                reservation_id: acceptance.reservation_id,
                replayed: acceptance.replayed,
            }),
        )),
        Admission::Rejected(reason) => Err(reason.into()),
    }
}

/// Redeem a reservation against an order.
///
/// # Errors
///
/// Returns [`AppError`]: 404 unknown, 403 not owner, 409 already used or not
/// redeemable, 422 policy window closed.
pub async fn use_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UseReservationRequest>,
) -> Result<Json<ReservationView>, AppError> {
    let record = state
        .lifecycle
        .use_reservation(
            ReservationId::from_uuid(id),
            RequesterId::new(body.requester_id),
            OrderId::new(body.order_id),
        )
        .await?;
    Ok(Json(record.into()))
}

/// Cancel a redeemed reservation.
///
/// # Errors
///
/// Returns [`AppError`]: 404 unknown, 403 not owner, 409 not used.
pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelReservationRequest>,
) -> Result<Json<ReservationView>, AppError> {
    let record = state
        .lifecycle
        .cancel(ReservationId::from_uuid(id), RequesterId::new(body.requester_id))
        .await?;
    Ok(Json(record.into()))
}

/// List a requester's reservations, newest first.
///
/// # Errors
///
/// Returns [`AppError`] for an unknown status filter (400) or an unreachable
/// ledger (503).
pub async fn list_reservations(
    State(state): State<AppState>,
    Path(requester_id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReservationView>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            ReservationStatus::parse(&s.to_ascii_uppercase())
                .ok_or_else(|| AppError::bad_request(format!("Unknown status: {s}")))
        })
        .transpose()?;
    let defaults = Page::default();
    let page = Page::new(
        query.page.unwrap_or(defaults.number),
        query.size.unwrap_or(defaults.size),
    );

    let records = state
        .lifecycle
        .list(RequesterId::new(requester_id), status, page)
        .await?;
    Ok(Json(records.into_iter().map(ReservationView::from).collect()))
}
