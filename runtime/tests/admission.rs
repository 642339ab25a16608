//! Admission path tests against in-memory collaborators.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Let-else assertions

use futures::future::join_all;
use reservation_core::lock::{DistributedLock, LockError, LockKey, LockOwner};
use reservation_core::{
    Acceptance, Admission, OutcomeStatus, PolicyId, RejectReason, ReservationIntent, ResourcePolicy,
};
use reservation_runtime::{
    AdmissionStrategy, Backends, CoordinatorConfig, Lease, ReservationCoordinator, ReserveError,
    StrategyKind, StrategyOutcome,
};
use reservation_testing::fixtures::{active_policy, future_policy, request, request_id};
use reservation_testing::{InMemoryBackends, InMemoryLock};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const STRATEGIES: [StrategyKind; 3] = [
    StrategyKind::LedgerCount,
    StrategyKind::CachedCounter,
    StrategyKind::AsyncQueue,
];

fn config(strategy: StrategyKind) -> CoordinatorConfig {
    CoordinatorConfig {
        strategy,
        ..CoordinatorConfig::default()
    }
}

fn coordinator(env: &InMemoryBackends, strategy: StrategyKind) -> ReservationCoordinator {
    ReservationCoordinator::new(config(strategy), env.backends()).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn last_unit_is_reserved_once() {
    for strategy in STRATEGIES {
        let env = InMemoryBackends::new();
        env.activate(active_policy(1, 1)).await;
        let coordinator = coordinator(&env, strategy);

        let admissions = join_all([
            coordinator.reserve(request(1, 10, "first")),
            coordinator.reserve(request(1, 11, "second")),
        ])
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect::<Vec<_>>();

        let accepted = admissions.iter().filter(|a| a.is_accepted()).count();
        let exhausted = admissions
            .iter()
            .filter(|a| a.rejection() == Some(RejectReason::Exhausted))
            .count();
        assert_eq!((accepted, exhausted), (1, 1), "strategy {strategy}");

        match strategy {
            StrategyKind::LedgerCount => {
                assert_eq!(env.ledger.records().len(), 1);
                // The baseline never touches the counter
                assert_eq!(env.counter.value(PolicyId::new(1)), Some(1));
            }
            StrategyKind::CachedCounter => {
                assert_eq!(env.ledger.records().len(), 1);
                assert_eq!(env.counter.value(PolicyId::new(1)), Some(0));
            }
            StrategyKind::AsyncQueue => {
                assert_eq!(env.queue.published().len(), 1);
                assert_eq!(env.counter.value(PolicyId::new(1)), Some(0));
            }
        }
    }
}

#[tokio::test]
async fn out_of_window_leaves_everything_untouched() {
    for strategy in STRATEGIES {
        let env = InMemoryBackends::new();
        env.activate(future_policy(1, 5)).await;
        let coordinator = coordinator(&env, strategy);

        let admission = coordinator.reserve(request(1, 10, "early")).await.unwrap();

        assert_eq!(admission, Admission::Rejected(RejectReason::OutOfWindow));
        assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
        assert_eq!(env.counter.decrement_calls(), 0);
        assert!(env.results.is_empty());
        assert!(env.queue.published().is_empty());
        assert!(env.ledger.records().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn busy_lock_rejects_after_bounded_wait() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.lock
        .hold_elsewhere(&LockKey::for_policy(PolicyId::new(1)), Duration::from_secs(60));
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    let started = tokio::time::Instant::now();
    let admission = coordinator.reserve(request(1, 10, "blocked")).await.unwrap();

    assert_eq!(admission, Admission::Rejected(RejectReason::LockBusy));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
    assert!(env.results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn expired_lease_of_crashed_holder_frees_the_policy() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    // A holder that died without releasing: only the lease bounds the outage
    env.lock
        .hold_elsewhere(&LockKey::for_policy(PolicyId::new(1)), Duration::from_secs(2));
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    let admission = coordinator.reserve(request(1, 10, "after-crash")).await.unwrap();

    assert!(admission.is_accepted());
}

// ============================================================================
// Input validation
// ============================================================================

#[tokio::test]
async fn zero_quantity_and_unknown_policy_are_rejected_early() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    let mut zero = request(1, 10, "zero");
    zero.quantity = 0;
    assert_eq!(
        coordinator.reserve(zero).await.unwrap(),
        Admission::Rejected(RejectReason::InvalidQuantity)
    );
    assert_eq!(
        coordinator.reserve(request(99, 10, "nope")).await.unwrap(),
        Admission::Rejected(RejectReason::PolicyNotFound)
    );
    assert_eq!(env.counter.decrement_calls(), 0);
    assert!(env.results.is_empty());
}

#[tokio::test]
async fn oversized_request_is_exhausted_without_side_effects() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 2)).await;
    let coordinator = coordinator(&env, StrategyKind::CachedCounter);

    let mut big = request(1, 10, "big");
    big.quantity = 3;
    assert_eq!(
        coordinator.reserve(big).await.unwrap(),
        Admission::Rejected(RejectReason::Exhausted)
    );
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(2));

    let recorded = env.results.record(&request_id("big")).unwrap();
    assert_eq!(recorded.status, OutcomeStatus::Failure);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn retried_request_id_replays_instead_of_taking_more_units() {
    for strategy in STRATEGIES {
        let env = InMemoryBackends::new();
        env.activate(active_policy(1, 5)).await;
        let coordinator = coordinator(&env, strategy);

        let first = coordinator.reserve(request(1, 10, "same")).await.unwrap();
        let second = coordinator.reserve(request(1, 10, "same")).await.unwrap();

        let Admission::Accepted(first) = first else {
            panic!("first submission should be accepted under {strategy}");
        };
        let Admission::Accepted(second) = second else {
            panic!("retry should be accepted under {strategy}");
        };
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.request_id, second.request_id);

        let units_taken = match strategy {
            StrategyKind::LedgerCount => env.ledger.records().len(),
            StrategyKind::CachedCounter => {
                assert_eq!(first.reservation_id, second.reservation_id);
                env.ledger.records().len()
            }
            StrategyKind::AsyncQueue => env.queue.published().len(),
        };
        assert_eq!(units_taken, 1, "strategy {strategy}");
    }
}

#[tokio::test]
async fn replayed_rejection_keeps_its_reason() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 0)).await;
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    for _ in 0..2 {
        assert_eq!(
            coordinator.reserve(request(1, 10, "late")).await.unwrap(),
            Admission::Rejected(RejectReason::Exhausted)
        );
    }
    // The replay did not reach the counter
    assert_eq!(env.counter.decrement_calls(), 1);
}

#[tokio::test]
async fn duplicate_ledger_insert_returns_the_unit() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let coordinator = coordinator(&env, StrategyKind::CachedCounter);

    coordinator.reserve(request(1, 10, "dup")).await.unwrap();
    // The claim is gone but the record stays: the second attempt hits the unique key
    env.results.evict(&request_id("dup"));
    let again = coordinator.reserve(request(1, 10, "dup")).await.unwrap();

    assert!(again.is_accepted());
    assert_eq!(env.ledger.records().len(), 1);
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(4));
}

#[tokio::test]
async fn request_ids_are_global_across_policies() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.activate(active_policy(2, 5)).await;
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    coordinator.reserve(request(1, 10, "shared")).await.unwrap();
    let other = coordinator.reserve(request(2, 10, "shared")).await.unwrap();

    let Admission::Accepted(other) = other else {
        panic!("reused request id should replay the first decision");
    };
    assert!(other.replayed);
    assert_eq!(env.queue.published().len(), 1);
    assert_eq!(env.counter.value(PolicyId::new(2)), Some(5));
}

// ============================================================================
// Outcome store faults
// ============================================================================

#[tokio::test]
async fn unrecorded_rejection_is_decided_again_on_retry() {
    for strategy in STRATEGIES {
        let env = InMemoryBackends::new();
        env.activate(active_policy(1, 1)).await;
        let coordinator = coordinator(&env, strategy);

        assert!(coordinator.reserve(request(1, 10, "a")).await.unwrap().is_accepted());
        env.results.complete_faults().fail_next(1);

        for _ in 0..2 {
            assert_eq!(
                coordinator.reserve(request(1, 11, "b")).await.unwrap(),
                Admission::Rejected(RejectReason::Exhausted),
                "strategy {strategy}"
            );
        }
        let outcome = env.results.record(&request_id("b")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failure, "strategy {strategy}");
        if strategy != StrategyKind::LedgerCount {
            assert_eq!(env.counter.value(PolicyId::new(1)), Some(0));
        }
    }
}

#[tokio::test]
async fn unrecorded_success_replays_from_the_ledger() {
    for strategy in [StrategyKind::LedgerCount, StrategyKind::CachedCounter] {
        let env = InMemoryBackends::new();
        env.activate(active_policy(1, 5)).await;
        env.results.complete_faults().fail_next(1);
        let coordinator = coordinator(&env, strategy);

        let Admission::Accepted(first) = coordinator.reserve(request(1, 10, "x")).await.unwrap()
        else {
            panic!("first submission should be accepted under {strategy}");
        };
        assert!(first.reservation_id.is_some());
        let pending = env.results.record(&request_id("x")).unwrap();
        assert_eq!(pending.status, OutcomeStatus::Pending);

        let again = coordinator.reserve(request(1, 10, "x")).await.unwrap();
        assert_eq!(
            again,
            Admission::Accepted(Acceptance {
                request_id: request_id("x"),
                reservation_id: first.reservation_id,
                replayed: true,
            }),
            "strategy {strategy}"
        );
        assert_eq!(env.ledger.records().len(), 1);
        let repaired = env.results.record(&request_id("x")).unwrap();
        assert_eq!(repaired.status, OutcomeStatus::Success);
        assert_eq!(repaired.reservation_id, first.reservation_id);
    }
}

// ============================================================================
// Faults after the decrement
// ============================================================================

#[tokio::test]
async fn publish_failure_compensates_and_releases_the_claim() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.queue.publish_faults().fail_next(1);
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    let result = coordinator.reserve(request(1, 10, "unlucky")).await;

    assert!(matches!(result, Err(ReserveError::Queue(_))));
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
    assert!(env.results.is_empty());
    assert!(!env.lock.is_locked(&LockKey::for_policy(PolicyId::new(1))));

    // The same request id may be submitted again
    assert!(
        coordinator
            .reserve(request(1, 10, "unlucky"))
            .await
            .unwrap()
            .is_accepted()
    );
}

#[tokio::test(start_paused = true)]
async fn failed_compensation_under_reports_never_over_reports() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.queue.publish_faults().fail_next(1);
    env.counter.increment_faults().fail_always(true);
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    assert!(coordinator.reserve(request(1, 10, "lost")).await.is_err());

    assert_eq!(env.counter.value(PolicyId::new(1)), Some(4));
    assert!(env.queue.published().is_empty());
}

#[tokio::test]
async fn ledger_failure_on_synchronous_path_compensates() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    env.ledger.insert_faults().fail_next(1);
    let coordinator = coordinator(&env, StrategyKind::CachedCounter);

    let result = coordinator.reserve(request(1, 10, "db-down")).await;

    assert!(matches!(result, Err(ReserveError::Ledger(_))));
    assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
    assert!(env.results.is_empty());
}

#[tokio::test]
async fn missing_counter_is_a_fault_not_a_rejection() {
    let env = InMemoryBackends::new();
    env.policies.insert(active_policy(1, 5));
    let coordinator = coordinator(&env, StrategyKind::AsyncQueue);

    let result = coordinator.reserve(request(1, 10, "cold")).await;

    assert!(matches!(result, Err(ReserveError::Counter(_))));
    assert!(env.results.is_empty());
}

// ============================================================================
// Lease loss
// ============================================================================

/// Delegates to an in-memory lock but reports the lease lost after `trusted_checks`.
struct LeaseLosingLock {
    inner: InMemoryLock,
    trusted_checks: u32,
    checks: AtomicU32,
}

impl DistributedLock for LeaseLosingLock {
    fn try_acquire(
        &self,
        key: &LockKey,
        owner: &LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        self.inner.try_acquire(key, owner, wait, lease)
    }

    fn release(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockError>> + Send + '_>> {
        self.inner.release(key, owner)
    }

    fn is_held_by(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        let check = self.checks.fetch_add(1, Ordering::SeqCst);
        if check >= self.trusted_checks {
            return Box::pin(async { Ok(false) });
        }
        self.inner.is_held_by(key, owner)
    }
}

fn with_lock(env: &InMemoryBackends, trusted_checks: u32) -> Backends {
    Backends {
        lock: Arc::new(LeaseLosingLock {
            inner: env.lock.clone(),
            trusted_checks,
            checks: AtomicU32::new(0),
        }),
        ..env.backends()
    }
}

#[tokio::test]
async fn lease_lost_before_claim_rejects_as_busy() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let coordinator =
        ReservationCoordinator::new(config(StrategyKind::AsyncQueue), with_lock(&env, 0)).unwrap();

    let admission = coordinator.reserve(request(1, 10, "slow")).await.unwrap();

    assert_eq!(admission, Admission::Rejected(RejectReason::LockBusy));
    assert_eq!(env.counter.decrement_calls(), 0);
    assert!(env.results.is_empty());
}

#[tokio::test]
async fn lease_lost_after_decrement_compensates() {
    for strategy in [StrategyKind::CachedCounter, StrategyKind::AsyncQueue] {
        let env = InMemoryBackends::new();
        env.activate(active_policy(1, 5)).await;
        let coordinator =
            ReservationCoordinator::new(config(strategy), with_lock(&env, 1)).unwrap();

        let admission = coordinator.reserve(request(1, 10, "paused")).await.unwrap();

        assert_eq!(admission, Admission::Rejected(RejectReason::LockBusy));
        assert_eq!(env.counter.value(PolicyId::new(1)), Some(5));
        assert!(env.results.is_empty(), "claim must be abandoned");
        assert!(env.queue.published().is_empty());
        assert!(env.ledger.records().is_empty());
    }
}

// ============================================================================
// Caller timeout
// ============================================================================

/// Takes longer than any caller is willing to wait.
struct StalledStrategy;

impl AdmissionStrategy for StalledStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AsyncQueue
    }

    fn admit<'a>(
        &'a self,
        _lease: &'a Lease<'a>,
        _intent: &'a ReservationIntent,
        _policy: &'a ResourcePolicy,
    ) -> Pin<Box<dyn Future<Output = Result<StrategyOutcome, ReserveError>> + Send + 'a>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StrategyOutcome::Exhausted)
        })
    }
}

#[tokio::test(start_paused = true)]
async fn caller_timeout_reports_busy_and_releases_later() {
    let env = InMemoryBackends::new();
    env.activate(active_policy(1, 5)).await;
    let coordinator = ReservationCoordinator::with_strategy(
        CoordinatorConfig::default(),
        env.backends(),
        Arc::new(StalledStrategy),
    )
    .unwrap();

    let admission = coordinator.reserve(request(1, 10, "stalled")).await.unwrap();
    assert_eq!(admission, Admission::Rejected(RejectReason::LockBusy));

    // The detached admission still finishes and releases its lock
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!env.lock.is_locked(&LockKey::for_policy(PolicyId::new(1))));
    let recorded = env.results.record(&request_id("stalled")).unwrap();
    assert_eq!(recorded.status, OutcomeStatus::Failure);
}

#[test]
fn inconsistent_timing_is_refused() {
    let env = InMemoryBackends::new();
    let config = CoordinatorConfig {
        lock_lease: Duration::from_secs(20),
        ..CoordinatorConfig::default()
    };
    assert!(ReservationCoordinator::new(config, env.backends()).is_err());
}
