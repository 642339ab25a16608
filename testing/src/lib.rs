//! # Reservation Testing
//!
//! Testing utilities for the reservation engine.
//!
//! This crate provides:
//! - In-memory implementations of every collaborator trait, with failure injection
//! - Deterministic clocks
//! - Fixtures for policies, requests and a fully wired [`InMemoryBackends`]
//! - proptest strategies for request streams
//!
//! ## Example
//!
//! ```ignore
//! use reservation_testing::{InMemoryBackends, fixtures};
//! use reservation_runtime::{CoordinatorConfig, ReservationCoordinator};
//!
//! #[tokio::test]
//! async fn last_unit_goes_once() {
//!     let env = InMemoryBackends::new();
//!     env.activate(fixtures::active_policy(1, 1)).await;
//!
//!     let coordinator =
//!         ReservationCoordinator::new(CoordinatorConfig::default(), env.backends()).unwrap();
//!     let first = coordinator.reserve(fixtures::request(1, 10, "a")).await.unwrap();
//!     let second = coordinator.reserve(fixtures::request(1, 11, "b")).await.unwrap();
//!
//!     assert!(first.is_accepted());
//!     assert!(!second.is_accepted());
//! }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned test mutexes

pub mod coordination;
pub mod fault;
pub mod fixtures;
pub mod queue;
pub mod stores;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reservation_core::environment::Clock;

/// Deterministic clocks.
pub mod mocks {
    use super::{ChronoDuration, Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use reservation_testing::mocks::FixedClock;
    /// use reservation_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A clock tests move by hand, shared between clones.
    ///
    /// Used to walk a policy out of its validity window mid-test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move forward.
        pub fn advance(&self, by: ChronoDuration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// The instant every fixture is anchored to (2025-01-01 00:00:00 UTC).
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// A fixed clock at [`epoch`].
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use coordination::{InMemoryLock, InMemoryQuantityCache};
pub use fault::FaultSwitch;
pub use fixtures::InMemoryBackends;
pub use mocks::{FixedClock, ManualClock, epoch, test_clock};
pub use queue::InMemoryIssuanceQueue;
pub use stores::{InMemoryLedger, InMemoryPolicyStore, InMemoryResultStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(epoch());
        let other = clock.clone();
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(other.now(), epoch() + ChronoDuration::minutes(5));
    }
}
