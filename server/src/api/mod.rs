//! API endpoints, organized by concern:
//! - Reservations: admission, use, cancel, listing
//! - Outcomes: polling and lost-request recovery
//! - Policies: counter activation

pub mod outcomes;
pub mod policies;
pub mod reservations;
