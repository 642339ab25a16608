//! Policy activation endpoint.
//!
//! - POST /api/policies/:id/activate - Initialize the policy's shared counter

use crate::error::AppError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use reservation_core::PolicyId;
use reservation_runtime::Activation;

/// Initialize a policy's counter for its validity window.
///
/// Idempotent: an existing counter is left untouched and reported with
/// `initialized: false`.
///
/// # Errors
///
/// Returns [`AppError`]: 404 unknown policy, 422 window already closed, 503 if a
/// backend is unreachable.
pub async fn activate(
    State(state): State<AppState>,
    Path(policy_id): Path<i64>,
) -> Result<Json<Activation>, AppError> {
    let activation = state.activator.activate(PolicyId::new(policy_id)).await?;
    Ok(Json(activation))
}
