//! HTTP server for the reservation engine.
//!
//! Exposes admission, outcome polling, use/cancel/list and policy activation over
//! Axum, and runs the issuance consumers in the same process.
//!
//! # Architecture
//!
//! ```text
//! HTTP ─► ReservationCoordinator ─► Redis (lock, counter, outcomes)
//!                                 └► Redpanda ─► IssuanceWorker ─► PostgreSQL
//! ```
//!
//! Tests build the router over in-memory backends with [`AppState::new`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod application;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod server;

pub use application::Application;
pub use config::Config;
pub use error::AppError;
pub use server::{AppState, build_router};
