//! # Reservation Core
//!
//! Domain types and collaborator traits for the scarce-resource reservation engine.
//!
//! The engine allocates a strictly bounded, perishable quantity of a resource (a coupon
//! slot, a flash-sale unit) to many concurrent requesters without overselling. This crate
//! holds everything the admission path and the issuance pipeline agree on:
//!
//! - **Types**: policies, reservation intents, durable reservation records, outcomes
//! - **Admission**: the tagged result of an admission decision ([`Admission`], [`RejectReason`])
//! - **Collaborators**: traits for the infrastructure the engine assumes is furnished
//!   elsewhere (shared counter, lock service, queue, result store, ledger, policy store)
//!
//! ## Architecture
//!
//! ```text
//! caller ─► ReservationCoordinator ─► lock + counter ─┬─► ledger (synchronous path)
//!                                                     │
//!                                                     └─► IssuanceQueue ─► IssuanceWorker
//!                                                                             │
//!                          ResultStore ◄──── poll ──── caller                 ▼
//!                              ▲                                       PersistentLedger
//!                              └──────────────── outcome ◄────────────────────┘
//! ```
//!
//! All collaborator traits return boxed futures so they can be injected as
//! `Arc<dyn Trait>` and swapped between in-memory, Redis, Redpanda and `PostgreSQL`
//! implementations without touching the engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod counter;
pub mod environment;
pub mod ledger;
pub mod lock;
pub mod outcome;
pub mod policy;
pub mod queue;
pub mod types;

// Re-export commonly used types
pub use admission::{Acceptance, Admission, RejectReason};
pub use chrono::{DateTime, Utc};
pub use types::*;
