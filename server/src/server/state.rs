//! Application state for the reservation HTTP server.
//!
//! Contains the engine services handlers call into:
//! - Coordinator (admission)
//! - Poller (outcomes and recovery)
//! - Lifecycle (use, cancel, list)
//! - Activator (counter initialization)

use reservation_runtime::{
    Backends, ConfigError, CoordinatorConfig, LifecycleConfig, OutcomePoller, PolicyActivator,
    ReservationCoordinator, ReservationLifecycle,
};

/// Application state shared across all HTTP handlers.
///
/// Every service is a cheap clone over the same [`Backends`].
#[derive(Clone)]
pub struct AppState {
    /// Admission path
    pub coordinator: ReservationCoordinator,
    /// Outcome polling and lost-request recovery
    pub poller: OutcomePoller,
    /// Use, cancel and list
    pub lifecycle: ReservationLifecycle,
    /// Counter activation
    pub activator: PolicyActivator,
}

impl AppState {
    /// Build every service over one set of backends.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the coordinator timing is inconsistent.
    pub fn new(
        backends: Backends,
        coordinator: CoordinatorConfig,
        lifecycle: LifecycleConfig,
    ) -> Result<Self, ConfigError> {
        let outcome_ttl = coordinator.outcome_ttl;
        Ok(Self {
            coordinator: ReservationCoordinator::new(coordinator, backends.clone())?,
            poller: OutcomePoller::new(backends.clone(), outcome_ttl),
            lifecycle: ReservationLifecycle::new(backends.clone(), lifecycle),
            activator: PolicyActivator::new(backends),
        })
    }
}
