//! Swappable admission strategies.
//!
//! Each strategy runs inside the coordinator's critical section, after the window
//! check and the idempotency claim, and decides how units are taken and committed:
//!
//! | Strategy        | Units taken from           | Commit              |
//! |-----------------|----------------------------|---------------------|
//! | `ledger-count`  | ledger sum under the lock  | direct ledger write |
//! | `cached-counter`| shared counter             | direct ledger write |
//! | `async-queue`   | shared counter             | queue publish       |
//!
//! Counter strategies use decrement-then-check: the decrement is the serialization
//! point, a negative result is compensated before anything acts on it, and any
//! failure after the decrement compensates before returning.

use crate::backends::Backends;
use crate::config::{CoordinatorConfig, StrategyKind};
use crate::coordinator::{Lease, ReserveError, compensate};
use crate::retry::RetryPolicy;
use reservation_core::counter::AtomicQuantityCache;
use reservation_core::environment::Clock;
use reservation_core::ledger::{InsertOutcome, PersistentLedger};
use reservation_core::queue::IssuanceQueue;
use reservation_core::{ReservationId, ReservationIntent, ReservationRecord, ResourcePolicy};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a strategy decided inside the critical section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// Units were taken and committed
    Admitted {
        /// Set when the record was written synchronously
        reservation_id: Option<ReservationId>,
    },
    /// Not enough units remain
    Exhausted,
    /// The lease could no longer be trusted; nothing was committed
    LeaseLost,
}

/// One way of turning an admitted intent into taken units.
pub trait AdmissionStrategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Take `intent.quantity` units of `policy` and commit them.
    ///
    /// Runs while the policy lock is held. Must leave the shared counter as it found
    /// it on every path other than `Admitted`.
    fn admit<'a>(
        &'a self,
        lease: &'a Lease<'a>,
        intent: &'a ReservationIntent,
        policy: &'a ResourcePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<StrategyOutcome, ReserveError>> + Send + 'a>>;
}

/// Build the strategy selected by configuration.
#[must_use]
pub fn for_kind(
    kind: StrategyKind,
    backends: &Backends,
    config: &CoordinatorConfig,
) -> Arc<dyn AdmissionStrategy> {
    match kind {
        StrategyKind::LedgerCount => Arc::new(LedgerCountStrategy {
            ledger: Arc::clone(&backends.ledger),
            clock: Arc::clone(&backends.clock),
        }),
        StrategyKind::CachedCounter => Arc::new(CachedCounterStrategy {
            counter: Arc::clone(&backends.counter),
            ledger: Arc::clone(&backends.ledger),
            clock: Arc::clone(&backends.clock),
            compensation: config.compensation_retry.clone(),
        }),
        StrategyKind::AsyncQueue => Arc::new(AsyncQueueStrategy {
            counter: Arc::clone(&backends.counter),
            queue: Arc::clone(&backends.queue),
            compensation: config.compensation_retry.clone(),
        }),
    }
}

/// Result of the commit step of a counter strategy.
enum Commit {
    /// Committed; the decrement stands
    Fresh(Option<ReservationId>),
    /// A record for this request already existed; the decrement must be undone
    Duplicate(ReservationId),
    /// Lease lost before committing
    LeaseLost,
}

/// Decrement, check, commit; compensate on every path that does not keep the units.
async fn take_units<F, Fut>(
    counter: &dyn AtomicQuantityCache,
    retry: &RetryPolicy,
    lease: &Lease<'_>,
    intent: &ReservationIntent,
    commit: F,
) -> Result<StrategyOutcome, ReserveError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<Commit, ReserveError>> + Send,
{
    let policy_id = intent.policy_id;
    let units = i64::from(intent.quantity);

    let remaining = counter.decrement_and_get(policy_id, units).await?;
    if remaining < 0 {
        debug!(%policy_id, units, remaining, "Counter went negative");
        compensate(counter, policy_id, units, retry).await;
        return Ok(StrategyOutcome::Exhausted);
    }

    let committed = match lease.is_held().await {
        Ok(true) => commit().await,
        Ok(false) => Ok(Commit::LeaseLost),
        Err(e) => Err(e.into()),
    };

    match committed {
        Ok(Commit::Fresh(reservation_id)) => {
            debug!(%policy_id, units, remaining, "Units taken");
            Ok(StrategyOutcome::Admitted { reservation_id })
        }
        Ok(Commit::Duplicate(reservation_id)) => {
            debug!(%policy_id, %reservation_id, "Request already recorded, returning units");
            compensate(counter, policy_id, units, retry).await;
            Ok(StrategyOutcome::Admitted {
                reservation_id: Some(reservation_id),
            })
        }
        Ok(Commit::LeaseLost) => {
            warn!(%policy_id, "Lease lost after decrement, returning units");
            compensate(counter, policy_id, units, retry).await;
            Ok(StrategyOutcome::LeaseLost)
        }
        Err(e) => {
            compensate(counter, policy_id, units, retry).await;
            Err(e)
        }
    }
}

/// Synchronous-lock baseline: count issued units in the ledger, no shared counter.
pub struct LedgerCountStrategy {
    ledger: Arc<dyn PersistentLedger>,
    clock: Arc<dyn Clock>,
}

impl AdmissionStrategy for LedgerCountStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LedgerCount
    }

    fn admit<'a>(
        &'a self,
        lease: &'a Lease<'a>,
        intent: &'a ReservationIntent,
        policy: &'a ResourcePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<StrategyOutcome, ReserveError>> + Send + 'a>> {
        Box::pin(async move {
            let issued = self.ledger.active_units(policy.id).await?;
            if issued + u64::from(intent.quantity) > u64::from(policy.total_quantity) {
                debug!(policy_id = %policy.id, issued, "Ledger count exhausted");
                return Ok(StrategyOutcome::Exhausted);
            }

            if !lease.is_held().await? {
                return Ok(StrategyOutcome::LeaseLost);
            }

            let record = ReservationRecord::issue(intent, self.clock.now());
            let stored = self.ledger.insert_if_absent(&record).await?.into_record();
            Ok(StrategyOutcome::Admitted {
                reservation_id: Some(stored.id),
            })
        })
    }
}

/// Shared counter for the decision, direct ledger write for the commit.
pub struct CachedCounterStrategy {
    counter: Arc<dyn AtomicQuantityCache>,
    ledger: Arc<dyn PersistentLedger>,
    clock: Arc<dyn Clock>,
    compensation: RetryPolicy,
}

impl AdmissionStrategy for CachedCounterStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CachedCounter
    }

    fn admit<'a>(
        &'a self,
        lease: &'a Lease<'a>,
        intent: &'a ReservationIntent,
        _policy: &'a ResourcePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<StrategyOutcome, ReserveError>> + Send + 'a>> {
        Box::pin(take_units(
            &*self.counter,
            &self.compensation,
            lease,
            intent,
            move || async move {
                let record = ReservationRecord::issue(intent, self.clock.now());
                let commit = match self.ledger.insert_if_absent(&record).await? {
                    InsertOutcome::Inserted(stored) => Commit::Fresh(Some(stored.id)),
                    InsertOutcome::AlreadyExists(existing) => Commit::Duplicate(existing.id),
                };
                Ok::<_, ReserveError>(commit)
            },
        ))
    }
}

/// Shared counter for the decision, queue hand-off for the commit.
///
/// Keeps ledger round trips out of the critical section entirely.
pub struct AsyncQueueStrategy {
    counter: Arc<dyn AtomicQuantityCache>,
    queue: Arc<dyn IssuanceQueue>,
    compensation: RetryPolicy,
}

impl AdmissionStrategy for AsyncQueueStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AsyncQueue
    }

    fn admit<'a>(
        &'a self,
        lease: &'a Lease<'a>,
        intent: &'a ReservationIntent,
        _policy: &'a ResourcePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<StrategyOutcome, ReserveError>> + Send + 'a>> {
        Box::pin(take_units(
            &*self.counter,
            &self.compensation,
            lease,
            intent,
            move || async move {
                self.queue.publish(intent).await?;
                Ok::<_, ReserveError>(Commit::Fresh(None))
            },
        ))
    }
}
