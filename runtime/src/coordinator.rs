//! The request-admission state machine.
//!
//! # Admission Steps
//!
//! ```text
//! quantity > 0 ? ─no─► REJECTED(INVALID_QUANTITY)
//! policy exists ? ─no─► REJECTED(POLICY_NOT_FOUND)
//! ┌─────────────────────────── spawned task ───────────────────────────┐
//! │ acquire lock (bounded wait) ─fail─► REJECTED(LOCK_BUSY)            │
//! │ window contains now ? ─no─► REJECTED(OUT_OF_WINDOW)                │
//! │ lease still held ? ─no─► REJECTED(LOCK_BUSY)                       │
//! │ claim request id ─taken─► replay earlier decision                  │
//! │ strategy: take units, commit (queue publish or ledger write)       │
//! │ record outcome                                                     │
//! │ release lock (every path)                                          │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rejections found before the counter is touched leave it alone; rejections and
//! faults found after a decrement compensate before returning. The critical section
//! runs on its own task so that a caller giving up (client disconnect, outer timeout)
//! cannot stop it between a decrement and its compensation, or before the release.

use crate::backends::Backends;
use crate::config::{ConfigError, CoordinatorConfig, StrategyKind};
use crate::metrics::AdmissionMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::strategy::{self, AdmissionStrategy, StrategyOutcome};
use reservation_core::counter::{AtomicQuantityCache, CounterError};
use reservation_core::ledger::LedgerError;
use reservation_core::lock::{DistributedLock, LockError, LockKey, LockOwner};
use reservation_core::outcome::ResultStoreError;
use reservation_core::policy::PolicyStoreError;
use reservation_core::queue::QueueError;
use reservation_core::{
    Acceptance, Admission, FailureReason, OutcomeRecord, OutcomeStatus, PolicyId, RejectReason,
    RequestId, RequesterId, ReservationIntent, ResourcePolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Infrastructure faults on the admission path.
///
/// Expected refusals are [`RejectReason`]s, not errors.
#[derive(Error, Debug)]
pub enum ReserveError {
    /// The policy store failed
    #[error("policy store: {0}")]
    Policy(#[from] PolicyStoreError),

    /// The shared counter failed
    #[error("counter: {0}")]
    Counter(#[from] CounterError),

    /// The lock service failed
    #[error("lock: {0}")]
    Lock(#[from] LockError),

    /// The issuance queue failed
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    /// The result store failed
    #[error("result store: {0}")]
    Results(#[from] ResultStoreError),

    /// The ledger failed
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    /// The admission task died before producing a decision
    #[error("admission task interrupted: {0}")]
    Interrupted(String),
}

/// One reservation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    /// Policy to take units from
    pub policy_id: PolicyId,
    /// Who the units are for
    pub requester_id: RequesterId,
    /// Units requested
    pub quantity: u32,
    /// Caller-supplied idempotency key
    pub request_id: RequestId,
}

/// A lock hold whose validity is re-checked before acting on it.
///
/// Trusted for the configured lease minus the safety margin, measured from the
/// moment acquisition returned; the margin absorbs the acquire round trip and
/// clock drift between this process and the lock service.
pub struct Lease<'a> {
    lock: &'a dyn DistributedLock,
    key: &'a LockKey,
    owner: &'a LockOwner,
    acquired_at: Instant,
    trusted_for: Duration,
}

impl<'a> Lease<'a> {
    pub(crate) fn new(
        lock: &'a dyn DistributedLock,
        key: &'a LockKey,
        owner: &'a LockOwner,
        trusted_for: Duration,
    ) -> Self {
        Self {
            lock,
            key,
            owner,
            acquired_at: Instant::now(),
            trusted_for,
        }
    }

    /// Whether the lock may still be relied upon.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock service is unreachable.
    pub async fn is_held(&self) -> Result<bool, LockError> {
        if self.acquired_at.elapsed() >= self.trusted_for {
            return Ok(false);
        }
        self.lock.is_held_by(self.key, self.owner).await
    }
}

/// Undo a decrement, retrying with backoff.
///
/// Returns whether the increment landed. A failure is logged at error level: the
/// counter then under-reports by `units`, it never over-reports.
pub(crate) async fn compensate(
    counter: &dyn AtomicQuantityCache,
    policy_id: PolicyId,
    units: i64,
    retry: &RetryPolicy,
) -> bool {
    let restored = retry_with_predicate(
        retry,
        || counter.increment_and_get(policy_id, units),
        |e| !matches!(e, CounterError::NotInitialized(_)),
    )
    .await;
    match restored {
        Ok(remaining) => {
            AdmissionMetrics::record_compensation(true);
            debug!(%policy_id, units, remaining, "Decrement compensated");
            true
        }
        Err(e) => {
            AdmissionMetrics::record_compensation(false);
            error!(
                %policy_id,
                units,
                error = %e,
                "Compensation failed, counter under-reports until reconciled"
            );
            false
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    backends: Backends,
    strategy: Arc<dyn AdmissionStrategy>,
}

/// Admits or rejects reservation requests for scarce policies.
///
/// Cheap to clone; clones share the same collaborators.
///
/// # Example
///
/// ```rust,ignore
/// let coordinator = ReservationCoordinator::new(CoordinatorConfig::default(), backends)?;
///
/// match coordinator.reserve(request).await? {
///     Admission::Accepted(acceptance) => poll(acceptance.request_id).await,
///     Admission::Rejected(reason) if reason.is_retryable() => back_off_and_retry().await,
///     Admission::Rejected(reason) => give_up(reason),
/// }
/// ```
#[derive(Clone)]
pub struct ReservationCoordinator {
    inner: Arc<Inner>,
}

impl ReservationCoordinator {
    /// Create a coordinator running the strategy named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the timing configuration is inconsistent.
    pub fn new(config: CoordinatorConfig, backends: Backends) -> Result<Self, ConfigError> {
        let strategy = strategy::for_kind(config.strategy, &backends, &config);
        Self::with_strategy(config, backends, strategy)
    }

    /// Create a coordinator with an explicit strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the timing configuration is inconsistent.
    pub fn with_strategy(
        config: CoordinatorConfig,
        backends: Backends,
        strategy: Arc<dyn AdmissionStrategy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(strategy = %strategy.kind(), "Reservation coordinator configured");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backends,
                strategy,
            }),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Decide a reservation request.
    ///
    /// `Accepted` on the asynchronous path only means the units were taken; the
    /// durable result must be polled. If the decision does not arrive within the
    /// configured request timeout the caller gets `REJECTED(LOCK_BUSY)`; the admission
    /// keeps running and a retry with the same request id replays its decision.
    ///
    /// # Errors
    ///
    /// Returns [`ReserveError`] for infrastructure faults.
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Admission, ReserveError> {
        let started = Instant::now();
        let result = self.decide(request).await;

        match &result {
            Ok(Admission::Accepted(acceptance)) => {
                AdmissionMetrics::record_accepted(acceptance.replayed, started.elapsed());
            }
            Ok(Admission::Rejected(reason)) => {
                AdmissionMetrics::record_rejected(*reason, started.elapsed());
            }
            Err(e) => {
                AdmissionMetrics::record_fault();
                warn!(error = %e, "Admission failed");
            }
        }
        result
    }

    async fn decide(&self, request: ReserveRequest) -> Result<Admission, ReserveError> {
        if request.quantity == 0 {
            return Ok(Admission::Rejected(RejectReason::InvalidQuantity));
        }

        let Some(policy) = self
            .inner
            .backends
            .policies
            .get_policy(request.policy_id)
            .await?
        else {
            debug!(policy_id = %request.policy_id, "Unknown policy");
            return Ok(Admission::Rejected(RejectReason::PolicyNotFound));
        };

        let inner = Arc::clone(&self.inner);
        let request_id = request.request_id.clone();
        let task = tokio::spawn(async move { inner.run_locked(request, policy).await });

        match tokio::time::timeout(self.inner.config.request_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_cancelled() => {
                warn!(%request_id, "Admission task cancelled");
                Ok(Admission::Rejected(RejectReason::LockBusy))
            }
            Ok(Err(join_error)) => {
                error!(%request_id, error = %join_error, "Admission task panicked");
                Err(ReserveError::Interrupted(join_error.to_string()))
            }
            Err(_) => {
                warn!(
                    %request_id,
                    timeout_ms = self.inner.config.request_timeout.as_millis(),
                    "Admission did not finish in time"
                );
                Ok(Admission::Rejected(RejectReason::LockBusy))
            }
        }
    }
}

impl Inner {
    async fn run_locked(
        &self,
        request: ReserveRequest,
        policy: ResourcePolicy,
    ) -> Result<Admission, ReserveError> {
        let lock = &*self.backends.lock;
        let key = LockKey::for_policy(policy.id);
        let owner = LockOwner::new();

        let wait_started = Instant::now();
        let acquired = lock
            .try_acquire(&key, &owner, self.config.lock_wait, self.config.lock_lease)
            .await?;
        AdmissionMetrics::record_lock_wait(wait_started.elapsed());

        if !acquired {
            debug!(
                policy_id = %policy.id,
                request_id = %request.request_id,
                "Policy lock busy"
            );
            return Ok(Admission::Rejected(RejectReason::LockBusy));
        }

        let lease = Lease::new(lock, &key, &owner, self.config.trusted_lease());
        let result = self.critical_section(&lease, request, &policy).await;

        if let Err(e) = lock.release(&key, &owner).await {
            // The lease bounds how long the key stays blocked.
            warn!(policy_id = %policy.id, error = %e, "Failed to release policy lock");
        }
        result
    }

    async fn critical_section(
        &self,
        lease: &Lease<'_>,
        request: ReserveRequest,
        policy: &ResourcePolicy,
    ) -> Result<Admission, ReserveError> {
        let now = self.backends.clock.now();
        if !policy.is_active_at(now) {
            debug!(policy_id = %policy.id, %now, "Outside policy window");
            return Ok(Admission::Rejected(RejectReason::OutOfWindow));
        }

        if !lease.is_held().await? {
            warn!(policy_id = %policy.id, "Lease lost before claiming");
            return Ok(Admission::Rejected(RejectReason::LockBusy));
        }

        let ttl = self.config.outcome_ttl;
        let claim = OutcomeRecord::pending(request.request_id.clone(), now);
        if let Some(existing) = self.backends.results.claim(&claim, ttl).await? {
            debug!(request_id = %request.request_id, status = ?existing.status, "Replaying request");
            return self.replay_claimed(policy.id, existing).await;
        }

        let intent = ReservationIntent {
            request_id: request.request_id,
            policy_id: policy.id,
            requester_id: request.requester_id,
            quantity: request.quantity,
            submitted_at: now,
        };

        match self.strategy.admit(lease, &intent, policy).await {
            Ok(StrategyOutcome::Admitted { reservation_id }) => {
                if let Some(reservation_id) = reservation_id {
                    let success =
                        OutcomeRecord::success(intent.request_id.clone(), reservation_id, now);
                    if let Err(e) = self.backends.results.complete(&success, ttl).await {
                        // The record is durable; replays and pollers recover it from the ledger.
                        warn!(request_id = %intent.request_id, error = %e, "Failed to record outcome");
                    }
                }
                debug!(
                    policy_id = %intent.policy_id,
                    request_id = %intent.request_id,
                    requester_id = %intent.requester_id,
                    quantity = intent.quantity,
                    "Admitted"
                );
                Ok(Admission::Accepted(Acceptance {
                    request_id: intent.request_id,
                    reservation_id,
                    replayed: false,
                }))
            }
            Ok(StrategyOutcome::Exhausted) => {
                let failure =
                    OutcomeRecord::failure(intent.request_id.clone(), FailureReason::Exhausted, now);
                if let Err(e) = self.backends.results.complete(&failure, ttl).await {
                    // A claim left PENDING would replay this rejection as accepted.
                    warn!(request_id = %intent.request_id, error = %e, "Failed to record outcome");
                    self.abandon(&intent.request_id).await;
                }
                debug!(policy_id = %intent.policy_id, request_id = %intent.request_id, "Exhausted");
                Ok(Admission::Rejected(RejectReason::Exhausted))
            }
            Ok(StrategyOutcome::LeaseLost) => {
                self.abandon(&intent.request_id).await;
                Ok(Admission::Rejected(RejectReason::LockBusy))
            }
            Err(e) => {
                self.abandon(&intent.request_id).await;
                Err(e)
            }
        }
    }

    /// Answer a request whose id was already claimed.
    ///
    /// A synchronous commit writes the ledger before the outcome, so a claim still
    /// `PENDING` there may hide a record whose outcome write failed.
    async fn replay_claimed(
        &self,
        policy_id: PolicyId,
        existing: OutcomeRecord,
    ) -> Result<Admission, ReserveError> {
        if existing.status != OutcomeStatus::Pending
            || self.strategy.kind() == StrategyKind::AsyncQueue
        {
            return Ok(replay(existing));
        }

        let Some(record) = self
            .backends
            .ledger
            .find_by_request(policy_id, &existing.request_id)
            .await?
        else {
            return Ok(replay(existing));
        };

        let now = self.backends.clock.now();
        let success = OutcomeRecord::success(existing.request_id.clone(), record.id, now);
        let ttl = self.config.outcome_ttl;
        if let Err(e) = self.backends.results.complete(&success, ttl).await {
            warn!(request_id = %existing.request_id, error = %e, "Failed to repair outcome");
        }
        Ok(Admission::Accepted(Acceptance {
            request_id: existing.request_id,
            reservation_id: Some(record.id),
            replayed: true,
        }))
    }

    async fn abandon(&self, request_id: &RequestId) {
        if let Err(e) = self.backends.results.abandon(request_id).await {
            warn!(%request_id, error = %e, "Failed to abandon claim");
        }
    }
}

/// Turn an earlier outcome for the same request id into this call's answer.
fn replay(existing: OutcomeRecord) -> Admission {
    let rejection = existing.reason.as_ref().and_then(RejectReason::from_failure);
    if let (OutcomeStatus::Failure, Some(reason)) = (existing.status, rejection) {
        return Admission::Rejected(reason);
    }
    Admission::Accepted(Acceptance {
        request_id: existing.request_id,
        reservation_id: existing.reservation_id,
        replayed: true,
    })
}
