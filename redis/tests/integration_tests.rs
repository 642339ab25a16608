//! Integration tests for the Redis collaborators using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running. Run with `cargo test -p reservation-redis -- --ignored`.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages
#![allow(clippy::unwrap_used)]

use chrono::Utc;
use reservation_core::counter::{AtomicQuantityCache, CounterError};
use reservation_core::lock::{DistributedLock, LockKey, LockOwner};
use reservation_core::outcome::ResultStore;
use reservation_core::{FailureReason, OutcomeRecord, OutcomeStatus, PolicyId, RequestId, ReservationId};
use reservation_redis::{ConnectionManager, RedisLock, RedisQuantityCache, RedisResultStore, connect};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

async fn setup_redis() -> (ContainerAsync<Redis>, ConnectionManager) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");
    let conn = connect(&format!("redis://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to redis");
    (container, conn)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn counter_never_resurrects_a_missing_key() {
    let (_container, conn) = setup_redis().await;
    let counter = RedisQuantityCache::new(conn);
    let policy = PolicyId::new(1);

    assert!(matches!(
        counter.decrement_and_get(policy, 1).await,
        Err(CounterError::NotInitialized(_))
    ));
    assert_eq!(counter.get(policy).await.unwrap(), None);

    assert!(counter.initialize(policy, 2, Some(Duration::from_secs(60))).await.unwrap());
    assert!(!counter.initialize(policy, 50, None).await.unwrap());
    assert_eq!(counter.decrement_and_get(policy, 3).await.unwrap(), -1);
    assert_eq!(counter.increment_and_get(policy, 3).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_decrements_are_atomic() {
    let (_container, conn) = setup_redis().await;
    let counter = RedisQuantityCache::new(conn);
    let policy = PolicyId::new(2);
    counter.initialize(policy, 10, None).await.unwrap();

    let results = futures_join(&counter, policy, 25).await;
    let winners = results.iter().filter(|remaining| **remaining >= 0).count();

    assert_eq!(winners, 10);
    assert_eq!(counter.get(policy).await.unwrap(), Some(-15));
}

async fn futures_join(counter: &RedisQuantityCache, policy: PolicyId, n: usize) -> Vec<i64> {
    let mut handles = Vec::with_capacity(n);
    for _ in 0..n {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            counter.decrement_and_get(policy, 1).await.unwrap()
        }));
    }
    let mut results = Vec::with_capacity(n);
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lock_is_exclusive_and_expires() {
    let (_container, conn) = setup_redis().await;
    let lock = RedisLock::new(conn).with_poll_interval(Duration::from_millis(10));
    let key = LockKey::for_policy(PolicyId::new(1));
    let first = LockOwner::new();
    let second = LockOwner::new();

    assert!(
        lock.try_acquire(&key, &first, Duration::from_millis(100), Duration::from_millis(500))
            .await
            .unwrap()
    );
    assert!(
        !lock
            .try_acquire(&key, &second, Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap()
    );

    // A non-owner release leaves the lock in place
    lock.release(&key, &second).await.unwrap();
    assert!(lock.is_held_by(&key, &first).await.unwrap());

    // The lease runs out; the second owner gets in within its wait
    assert!(
        lock.try_acquire(&key, &second, Duration::from_secs(2), Duration::from_secs(5))
            .await
            .unwrap()
    );
    assert!(!lock.is_held_by(&key, &first).await.unwrap());

    // The expired holder's release does not delete the new holder's key
    lock.release(&key, &first).await.unwrap();
    assert!(lock.is_held_by(&key, &second).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn outcomes_are_claimed_once_and_completed_once() {
    let (_container, conn) = setup_redis().await;
    let store = RedisResultStore::new(conn);
    let ttl = Duration::from_secs(60);
    let request_id = RequestId::parse("integration-1").unwrap();

    let pending = OutcomeRecord::pending(request_id.clone(), Utc::now());
    assert!(store.claim(&pending, ttl).await.unwrap().is_none());
    let again = store.claim(&pending, ttl).await.unwrap().unwrap();
    assert_eq!(again.status, OutcomeStatus::Pending);

    let success = OutcomeRecord::success(request_id.clone(), ReservationId::new(), Utc::now());
    assert_eq!(store.complete(&success, ttl).await.unwrap(), success);

    let failure = OutcomeRecord::failure(request_id.clone(), FailureReason::Exhausted, Utc::now());
    assert_eq!(store.complete(&failure, ttl).await.unwrap(), success);

    store.abandon(&request_id).await.unwrap();
    assert_eq!(store.get(&request_id).await.unwrap(), Some(success));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn abandoned_claim_frees_the_request_id() {
    let (_container, conn) = setup_redis().await;
    let store = RedisResultStore::new(conn);
    let request_id = RequestId::parse("integration-2").unwrap();

    store
        .claim(&OutcomeRecord::pending(request_id.clone(), Utc::now()), Duration::from_secs(60))
        .await
        .unwrap();
    store.abandon(&request_id).await.unwrap();

    assert!(store.get(&request_id).await.unwrap().is_none());
}
