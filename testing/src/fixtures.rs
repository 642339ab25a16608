//! Policies, requests and a fully wired set of in-memory collaborators.

use crate::coordination::{InMemoryLock, InMemoryQuantityCache};
use crate::mocks::{ManualClock, epoch};
use crate::queue::InMemoryIssuanceQueue;
use crate::stores::{InMemoryLedger, InMemoryPolicyStore, InMemoryResultStore};
use chrono::Duration as ChronoDuration;
use reservation_core::counter::AtomicQuantityCache;
use reservation_core::{PolicyId, RequestId, RequesterId, ResourcePolicy};
use reservation_runtime::{Backends, ReserveRequest};
use std::sync::Arc;

/// A policy open from one hour before [`epoch`] to one day after it.
#[must_use]
pub fn active_policy(id: i64, total_quantity: u32) -> ResourcePolicy {
    ResourcePolicy {
        id: PolicyId::new(id),
        name: format!("policy-{id}"),
        total_quantity,
        valid_from: epoch() - ChronoDuration::hours(1),
        valid_until: epoch() + ChronoDuration::days(1),
    }
}

/// A policy whose window opens one hour after [`epoch`].
#[must_use]
pub fn future_policy(id: i64, total_quantity: u32) -> ResourcePolicy {
    ResourcePolicy {
        valid_from: epoch() + ChronoDuration::hours(1),
        valid_until: epoch() + ChronoDuration::days(1),
        ..active_policy(id, total_quantity)
    }
}

/// Parse a request id, panicking on invalid input.
#[must_use]
pub fn request_id(value: &str) -> RequestId {
    RequestId::parse(value).unwrap()
}

/// A single-unit request.
#[must_use]
pub fn request(policy_id: i64, requester_id: i64, id: &str) -> ReserveRequest {
    ReserveRequest {
        policy_id: PolicyId::new(policy_id),
        requester_id: RequesterId::new(requester_id),
        quantity: 1,
        request_id: request_id(id),
    }
}

/// Every collaborator, in memory, with a [`ManualClock`] starting at [`epoch`].
///
/// Fields are public so tests can inspect state and arm failures directly.
#[derive(Clone, Debug)]
pub struct InMemoryBackends {
    /// Policy definitions
    pub policies: InMemoryPolicyStore,
    /// Shared counter
    pub counter: InMemoryQuantityCache,
    /// Lock service
    pub lock: InMemoryLock,
    /// Issuance queue
    pub queue: InMemoryIssuanceQueue,
    /// Outcome store
    pub results: InMemoryResultStore,
    /// Durable ledger
    pub ledger: InMemoryLedger,
    /// Clock
    pub clock: ManualClock,
}

impl Default for InMemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackends {
    /// Fresh, empty collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: InMemoryPolicyStore::new(),
            counter: InMemoryQuantityCache::new(),
            lock: InMemoryLock::new(),
            queue: InMemoryIssuanceQueue::new(),
            results: InMemoryResultStore::new(),
            ledger: InMemoryLedger::new(),
            clock: ManualClock::new(epoch()),
        }
    }

    /// Register a policy and initialize its counter to the full quantity.
    pub async fn activate(&self, policy: ResourcePolicy) {
        let id = policy.id;
        let total = i64::from(policy.total_quantity);
        self.policies.insert(policy);
        self.counter.initialize(id, total, None).await.unwrap();
    }

    /// The trait-object view the engine consumes. Shares state with `self`.
    #[must_use]
    pub fn backends(&self) -> Backends {
        Backends {
            policies: Arc::new(self.policies.clone()),
            counter: Arc::new(self.counter.clone()),
            lock: Arc::new(self.lock.clone()),
            queue: Arc::new(self.queue.clone()),
            results: Arc::new(self.results.clone()),
            ledger: Arc::new(self.ledger.clone()),
            clock: Arc::new(self.clock.clone()),
        }
    }
}

/// proptest strategies.
pub mod strategies {
    use super::{PolicyId, RequesterId, ReserveRequest, request_id};
    use proptest::prelude::*;

    /// A burst of requests against one policy.
    ///
    /// Request ids are drawn from a small pool so bursts contain retries of the same id.
    pub fn request_burst(
        policy_id: i64,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<ReserveRequest>> {
        prop::collection::vec((1_i64..=20, 0_u32..40, 1_u32..=3), 1..=max_len).prop_map(
            move |entries| {
                entries
                    .into_iter()
                    .map(|(requester, key, quantity)| ReserveRequest {
                        policy_id: PolicyId::new(policy_id),
                        requester_id: RequesterId::new(requester),
                        quantity,
                        request_id: request_id(&format!("req-{key}")),
                    })
                    .collect()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reservation_core::environment::Clock;
    use reservation_core::policy::PolicyStore;

    #[tokio::test]
    async fn activate_initializes_counter() {
        let env = InMemoryBackends::new();
        env.activate(active_policy(3, 5)).await;
        assert_eq!(env.counter.value(PolicyId::new(3)), Some(5));

        let backends = env.backends();
        assert!(backends.policies.get_policy(PolicyId::new(3)).await.unwrap().is_some());
        assert_eq!(backends.clock.now(), epoch());
    }

    #[test]
    fn future_policy_is_not_active_yet() {
        assert!(!future_policy(1, 1).is_active_at(epoch()));
        assert!(active_policy(1, 1).is_active_at(epoch()));
    }
}
