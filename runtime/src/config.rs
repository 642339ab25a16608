//! Tunables for the coordinator, the issuance workers and the lifecycle service.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Lock wait must be positive
    #[error("lock wait must be greater than zero")]
    ZeroLockWait,

    /// Lease does not leave room for the safety margin
    #[error("lock lease ({lease:?}) must be longer than the lease safety margin ({margin:?})")]
    LeaseWithinSafetyMargin {
        /// Configured lease
        lease: Duration,
        /// Configured margin
        margin: Duration,
    },

    /// A crashed holder could outlive the caller's patience
    #[error("lock lease ({lease:?}) must be shorter than the request timeout ({timeout:?})")]
    LeaseNotShorterThanTimeout {
        /// Configured lease
        lease: Duration,
        /// Configured caller timeout
        timeout: Duration,
    },

    /// Worker pool needs at least one consumer
    #[error("worker concurrency must be at least 1")]
    ZeroConcurrency,

    /// Unrecognized strategy name
    #[error("unknown reservation strategy '{0}' (expected ledger-count, cached-counter or async-queue)")]
    UnknownStrategy(String),
}

/// Which admission strategy the coordinator runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Count issued units in the ledger under the lock and write synchronously
    LedgerCount,
    /// Decrement the shared counter and write the ledger synchronously
    CachedCounter,
    /// Decrement the shared counter and hand the write to the issuance queue
    #[default]
    AsyncQueue,
}

impl StrategyKind {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LedgerCount => "ledger-count",
            Self::CachedCounter => "cached-counter",
            Self::AsyncQueue => "async-queue",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ledger-count" => Ok(Self::LedgerCount),
            "cached-counter" => Ok(Self::CachedCounter),
            "async-queue" => Ok(Self::AsyncQueue),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Admission path configuration.
///
/// # Default Values
///
/// - `lock_wait`: 3 seconds
/// - `lock_lease`: 5 seconds
/// - `lease_safety_margin`: 500ms
/// - `request_timeout`: 10 seconds
/// - `outcome_ttl`: 10 minutes
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Admission strategy
    pub strategy: StrategyKind,
    /// How long to wait for the policy lock
    pub lock_wait: Duration,
    /// How long a held lock survives without release
    pub lock_lease: Duration,
    /// Local slack subtracted from the lease before trusting it
    pub lease_safety_margin: Duration,
    /// The longest any caller waits for an admission decision
    pub request_timeout: Duration,
    /// Lifetime of outcome records
    pub outcome_ttl: Duration,
    /// Backoff for counter compensation
    pub compensation_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(5),
            lease_safety_margin: Duration::from_millis(500),
            request_timeout: Duration::from_secs(10),
            outcome_ttl: Duration::from_secs(600),
            compensation_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(1))
                .build(),
        }
    }
}

impl CoordinatorConfig {
    /// Check the timing relationships the admission path relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a zero lock wait, a lease that does not exceed the
    /// safety margin, or a lease that is not shorter than the request timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_wait.is_zero() {
            return Err(ConfigError::ZeroLockWait);
        }
        if self.lock_lease <= self.lease_safety_margin {
            return Err(ConfigError::LeaseWithinSafetyMargin {
                lease: self.lock_lease,
                margin: self.lease_safety_margin,
            });
        }
        if self.lock_lease >= self.request_timeout {
            return Err(ConfigError::LeaseNotShorterThanTimeout {
                lease: self.lock_lease,
                timeout: self.request_timeout,
            });
        }
        Ok(())
    }

    /// How long the holder may trust its lease after acquiring it.
    #[must_use]
    pub fn trusted_lease(&self) -> Duration {
        self.lock_lease.saturating_sub(self.lease_safety_margin)
    }
}

/// Issuance worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Number of consumers in the pool
    pub concurrency: usize,
    /// Delay before resubscribing after a lost subscription
    pub retry_delay: Duration,
    /// Backoff for transient ledger failures
    pub persistence_retry: RetryPolicy,
    /// Lifetime of outcome records
    pub outcome_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry_delay: Duration::from_secs(5),
            persistence_retry: RetryPolicy::default(),
            outcome_ttl: Duration::from_secs(600),
        }
    }
}

impl WorkerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroConcurrency`] for an empty pool.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// What cancelling a used reservation does to the shared counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationPolicy {
    /// Cancelled units stay consumed; the counter is not touched
    #[default]
    RetainConsumed,
    /// Cancelled units return to the pool
    RestoreInventory,
}

/// Reservation lifecycle configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Cancellation inventory model
    pub cancellation: CancellationPolicy,
}
