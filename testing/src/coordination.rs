//! In-memory shared counter and lock service.
//!
//! Both use `tokio::time::Instant`, so tests running with paused time control
//! lease and TTL expiry deterministically.

use crate::fault::FaultSwitch;
use reservation_core::PolicyId;
use reservation_core::counter::{AtomicQuantityCache, CounterError};
use reservation_core::lock::{DistributedLock, LockError, LockKey, LockOwner};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Counter
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// HashMap-backed [`AtomicQuantityCache`].
///
/// Every operation runs under one mutex, which makes decrement and increment
/// atomic the way a single-threaded cache server is.
#[derive(Clone, Debug, Default)]
pub struct InMemoryQuantityCache {
    entries: Arc<Mutex<HashMap<PolicyId, CounterEntry>>>,
    decrements: Arc<AtomicU64>,
    decrement_faults: FaultSwitch,
    increment_faults: FaultSwitch,
}

impl InMemoryQuantityCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a counter without TTL.
    pub fn set(&self, policy_id: PolicyId, value: i64) {
        self.entries.lock().unwrap().insert(
            policy_id,
            CounterEntry {
                value,
                expires_at: None,
            },
        );
    }

    /// Drop a counter, as if the cache lost it.
    pub fn remove(&self, policy_id: PolicyId) {
        self.entries.lock().unwrap().remove(&policy_id);
    }

    /// Current value without going through the trait.
    #[must_use]
    pub fn value(&self, policy_id: PolicyId) -> Option<i64> {
        self.entries
            .lock()
            .unwrap()
            .get(&policy_id)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value)
    }

    /// How many decrements reached the counter.
    #[must_use]
    pub fn decrement_calls(&self) -> u64 {
        self.decrements.load(Ordering::SeqCst)
    }

    /// Failure injection for `decrement_and_get`.
    #[must_use]
    pub const fn decrement_faults(&self) -> &FaultSwitch {
        &self.decrement_faults
    }

    /// Failure injection for `increment_and_get` (compensation).
    #[must_use]
    pub const fn increment_faults(&self) -> &FaultSwitch {
        &self.increment_faults
    }

    fn apply(&self, policy_id: PolicyId, delta: i64) -> Result<i64, CounterError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&policy_id) {
            Some(entry) if entry.is_live() => {
                entry.value += delta;
                Ok(entry.value)
            }
            _ => {
                entries.remove(&policy_id);
                Err(CounterError::NotInitialized(policy_id))
            }
        }
    }
}

impl AtomicQuantityCache for InMemoryQuantityCache {
    fn initialize(
        &self,
        policy_id: PolicyId,
        value: i64,
        ttl: Option<Duration>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CounterError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap();
            if entries.get(&policy_id).is_some_and(CounterEntry::is_live) {
                return Ok(false);
            }
            entries.insert(
                policy_id,
                CounterEntry {
                    value,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    fn decrement_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>> {
        Box::pin(async move {
            if self.decrement_faults.trip() {
                return Err(CounterError::ConnectionFailed("injected".into()));
            }
            self.decrements.fetch_add(1, Ordering::SeqCst);
            self.apply(policy_id, -n)
        })
    }

    fn increment_and_get(
        &self,
        policy_id: PolicyId,
        n: i64,
    ) -> Pin<Box<dyn Future<Output = Result<i64, CounterError>> + Send + '_>> {
        Box::pin(async move {
            if self.increment_faults.trip() {
                return Err(CounterError::ConnectionFailed("injected".into()));
            }
            self.apply(policy_id, n)
        })
    }

    fn get(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, CounterError>> + Send + '_>> {
        Box::pin(async move { Ok(self.value(policy_id)) })
    }
}

// ============================================================================
// Lock
// ============================================================================

#[derive(Clone, Debug)]
struct Hold {
    owner: String,
    expires_at: Instant,
}

/// HashMap-backed [`DistributedLock`] with lease expiry.
///
/// `try_acquire` polls until the wait window closes, like a client retrying
/// `SET NX` against a lock server.
#[derive(Clone, Debug)]
pub struct InMemoryLock {
    holds: Arc<Mutex<HashMap<String, Hold>>>,
    poll_interval: Duration,
    faults: FaultSwitch,
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLock {
    /// Create a lock service polling every 2ms while waiting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            holds: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: Duration::from_millis(2),
            faults: FaultSwitch::new(),
        }
    }

    /// Hold `key` on behalf of an outside owner for `lease`.
    pub fn hold_elsewhere(&self, key: &LockKey, lease: Duration) -> LockOwner {
        let owner = LockOwner::new();
        self.holds.lock().unwrap().insert(
            key.as_str().to_string(),
            Hold {
                owner: owner.as_str().to_string(),
                expires_at: Instant::now() + lease,
            },
        );
        owner
    }

    /// Drop whatever hold exists on `key`, as if its lease ran out.
    pub fn expire(&self, key: &LockKey) {
        self.holds.lock().unwrap().remove(key.as_str());
    }

    /// Whether anyone holds `key` right now.
    #[must_use]
    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.holds
            .lock()
            .unwrap()
            .get(key.as_str())
            .is_some_and(|hold| Instant::now() < hold.expires_at)
    }

    /// Failure injection for every operation.
    #[must_use]
    pub const fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    fn try_once(&self, key: &str, owner: &str, lease: Duration) -> bool {
        let mut holds = self.holds.lock().unwrap();
        let now = Instant::now();
        if holds.get(key).is_some_and(|hold| now < hold.expires_at) {
            return false;
        }
        holds.insert(
            key.to_string(),
            Hold {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        true
    }
}

impl DistributedLock for InMemoryLock {
    fn try_acquire(
        &self,
        key: &LockKey,
        owner: &LockOwner,
        wait: Duration,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        let key = key.as_str().to_string();
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            if self.faults.trip() {
                return Err(LockError::ConnectionFailed("injected".into()));
            }
            let deadline = Instant::now() + wait;
            loop {
                if self.try_once(&key, &owner, lease) {
                    return Ok(true);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn release(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<(), LockError>> + Send + '_>> {
        let key = key.as_str().to_string();
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            if self.faults.trip() {
                return Err(LockError::ConnectionFailed("injected".into()));
            }
            let mut holds = self.holds.lock().unwrap();
            if holds.get(&key).is_some_and(|hold| hold.owner == owner) {
                holds.remove(&key);
            }
            Ok(())
        })
    }

    fn is_held_by(
        &self,
        key: &LockKey,
        owner: &LockOwner,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + '_>> {
        let key = key.as_str().to_string();
        let owner = owner.as_str().to_string();
        Box::pin(async move {
            if self.faults.trip() {
                return Err(LockError::ConnectionFailed("injected".into()));
            }
            Ok(self
                .holds
                .lock()
                .unwrap()
                .get(&key)
                .is_some_and(|hold| hold.owner == owner && Instant::now() < hold.expires_at))
        })
    }
}
