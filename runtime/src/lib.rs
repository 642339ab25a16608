//! # Reservation Runtime
//!
//! The engine proper: the admission coordinator, its strategies, the issuance
//! workers, outcome polling and the post-issuance lifecycle.
//!
//! ## Core Components
//!
//! - **[`ReservationCoordinator`]**: lock, window check, idempotency claim, strategy, release
//! - **[`AdmissionStrategy`]**: `ledger-count`, `cached-counter` or `async-queue`
//! - **[`IssuanceWorker`] / [`WorkerPool`]**: queue consumers that write the ledger
//! - **[`OutcomePoller`]**: the polling contract and lost-request recovery
//! - **[`ReservationLifecycle`] / [`PolicyActivator`]**: use, cancel, list, activate
//!
//! ## Example
//!
//! ```ignore
//! use reservation_runtime::{CoordinatorConfig, ReservationCoordinator, ReserveRequest};
//!
//! let coordinator = ReservationCoordinator::new(CoordinatorConfig::default(), backends)?;
//! let admission = coordinator
//!     .reserve(ReserveRequest {
//!         policy_id: PolicyId::new(7),
//!         requester_id: RequesterId::new(42),
//!         quantity: 1,
//!         request_id: RequestId::parse("checkout-42-1")?,
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backends;
pub mod config;
pub mod coordinator;
pub mod lifecycle;
pub mod metrics;
pub mod poller;
pub mod retry;
pub mod strategy;
pub mod worker;

pub use backends::Backends;
pub use config::{
    CancellationPolicy, ConfigError, CoordinatorConfig, LifecycleConfig, StrategyKind,
    WorkerConfig,
};
pub use coordinator::{Lease, ReservationCoordinator, ReserveError, ReserveRequest};
pub use lifecycle::{Activation, LifecycleError, PolicyActivator, ReservationLifecycle};
pub use poller::{OutcomePoller, PollError, PollStatus, Recovery};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use strategy::{AdmissionStrategy, StrategyOutcome};
pub use worker::{IssuanceConsumer, IssuanceResult, IssuanceWorker, WorkerError, WorkerPool};
