//! Router configuration for the reservation API.

use super::health::health_check;
use super::state::AppState;
use crate::api::{outcomes, policies, reservations};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Health lives at the root; everything else is nested under `/api`.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Admission
        .route("/reservations", post(reservations::reserve))
        // Post-issuance lifecycle
        .route("/reservations/:id/use", post(reservations::use_reservation))
        .route("/reservations/:id/cancel", post(reservations::cancel_reservation))
        .route(
            "/requesters/:id/reservations",
            get(reservations::list_reservations),
        )
        // Outcome polling
        .route("/outcomes/:request_id", get(outcomes::get_outcome))
        .route("/outcomes/:request_id/recover", post(outcomes::recover))
        // Counter activation
        .route("/policies/:id/activate", post(policies::activate));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
