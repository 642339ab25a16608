//! In-memory policy store, result store and ledger.

use crate::fault::FaultSwitch;
use reservation_core::ledger::{InsertOutcome, LedgerError, Page, PersistentLedger, StatusChange};
use reservation_core::outcome::{ResultStore, ResultStoreError};
use reservation_core::policy::{PolicyStore, PolicyStoreError};
use reservation_core::{
    OutcomeRecord, OutcomeStatus, PolicyId, RequestId, RequesterId, ReservationId,
    ReservationRecord, ReservationStatus, ResourcePolicy,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Policies
// ============================================================================

/// HashMap-backed [`PolicyStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<PolicyId, ResourcePolicy>>>,
    faults: FaultSwitch,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a policy.
    pub fn insert(&self, policy: ResourcePolicy) {
        self.policies.write().unwrap().insert(policy.id, policy);
    }

    /// Delete a policy.
    pub fn remove(&self, policy_id: PolicyId) {
        self.policies.write().unwrap().remove(&policy_id);
    }

    /// Failure injection for `get_policy`.
    #[must_use]
    pub const fn faults(&self) -> &FaultSwitch {
        &self.faults
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourcePolicy>, PolicyStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            if self.faults.trip() {
                return Err(PolicyStoreError::ConnectionFailed("injected".into()));
            }
            Ok(self.policies.read().unwrap().get(&policy_id).cloned())
        })
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Clone, Debug)]
struct StoredOutcome {
    record: OutcomeRecord,
    expires_at: Instant,
}

/// HashMap-backed [`ResultStore`] with per-record expiry.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResultStore {
    outcomes: Arc<Mutex<HashMap<RequestId, StoredOutcome>>>,
    faults: FaultSwitch,
    complete_faults: FaultSwitch,
}

impl InMemoryResultStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The live record for a request id.
    #[must_use]
    pub fn record(&self, request_id: &RequestId) -> Option<OutcomeRecord> {
        Self::live(&mut self.outcomes.lock().unwrap(), request_id)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.outcomes
            .lock()
            .unwrap()
            .values()
            .filter(|stored| now < stored.expires_at)
            .count()
    }

    /// Whether no live record exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget a record, as if it expired.
    pub fn evict(&self, request_id: &RequestId) {
        self.outcomes.lock().unwrap().remove(request_id);
    }

    /// Failure injection for every operation.
    #[must_use]
    pub const fn faults(&self) -> &FaultSwitch {
        &self.faults
    }

    /// Failure injection for `complete` only.
    #[must_use]
    pub const fn complete_faults(&self) -> &FaultSwitch {
        &self.complete_faults
    }

    fn live(
        outcomes: &mut HashMap<RequestId, StoredOutcome>,
        request_id: &RequestId,
    ) -> Option<OutcomeRecord> {
        match outcomes.get(request_id) {
            Some(stored) if Instant::now() < stored.expires_at => Some(stored.record.clone()),
            Some(_) => {
                outcomes.remove(request_id);
                None
            }
            None => None,
        }
    }

    fn check(&self) -> Result<(), ResultStoreError> {
        if self.faults.trip() {
            return Err(ResultStoreError::ConnectionFailed("injected".into()));
        }
        Ok(())
    }
}

impl ResultStore for InMemoryResultStore {
    fn claim(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>
    {
        let record = record.clone();
        Box::pin(async move {
            self.check()?;
            let mut outcomes = self.outcomes.lock().unwrap();
            if let Some(existing) = Self::live(&mut outcomes, &record.request_id) {
                return Ok(Some(existing));
            }
            outcomes.insert(
                record.request_id.clone(),
                StoredOutcome {
                    record,
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(None)
        })
    }

    fn complete(
        &self,
        record: &OutcomeRecord,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<OutcomeRecord, ResultStoreError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            self.check()?;
            if self.complete_faults.trip() {
                return Err(ResultStoreError::ConnectionFailed("injected".into()));
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            if let Some(existing) =
                Self::live(&mut outcomes, &record.request_id).filter(OutcomeRecord::is_terminal)
            {
                return Ok(existing);
            }
            outcomes.insert(
                record.request_id.clone(),
                StoredOutcome {
                    record: record.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
            Ok(record)
        })
    }

    fn abandon(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ResultStoreError>> + Send + '_>> {
        let request_id = request_id.clone();
        Box::pin(async move {
            self.check()?;
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes
                .get(&request_id)
                .is_some_and(|stored| stored.record.status == OutcomeStatus::Pending)
            {
                outcomes.remove(&request_id);
            }
            Ok(())
        })
    }

    fn get(
        &self,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutcomeRecord>, ResultStoreError>> + Send + '_>>
    {
        let request_id = request_id.clone();
        Box::pin(async move {
            self.check()?;
            Ok(Self::live(&mut self.outcomes.lock().unwrap(), &request_id))
        })
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Vec-backed [`PersistentLedger`] enforcing the `(policy, request id)` uniqueness
/// a database constraint would.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    records: Arc<Mutex<Vec<ReservationRecord>>>,
    insert_faults: FaultSwitch,
    read_faults: FaultSwitch,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<ReservationRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Records of one policy.
    #[must_use]
    pub fn records_for(&self, policy_id: PolicyId) -> Vec<ReservationRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.policy_id == policy_id)
            .cloned()
            .collect()
    }

    /// Insert directly, bypassing uniqueness, for seeding fixtures.
    pub fn seed(&self, record: ReservationRecord) {
        self.records.lock().unwrap().push(record);
    }

    /// Failure injection for `insert_if_absent`.
    #[must_use]
    pub const fn insert_faults(&self) -> &FaultSwitch {
        &self.insert_faults
    }

    /// Failure injection for reads.
    #[must_use]
    pub const fn read_faults(&self) -> &FaultSwitch {
        &self.read_faults
    }

    fn check_read(&self) -> Result<(), LedgerError> {
        if self.read_faults.trip() {
            return Err(LedgerError::ConnectionFailed("injected".into()));
        }
        Ok(())
    }
}

impl PersistentLedger for InMemoryLedger {
    fn insert_if_absent(
        &self,
        record: &ReservationRecord,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, LedgerError>> + Send + '_>> {
        let record = record.clone();
        Box::pin(async move {
            if self.insert_faults.trip() {
                return Err(LedgerError::DatabaseError("injected".into()));
            }
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.iter().find(|r| {
                r.policy_id == record.policy_id && r.request_id == record.request_id
            }) {
                return Ok(InsertOutcome::AlreadyExists(existing.clone()));
            }
            records.push(record.clone());
            Ok(InsertOutcome::Inserted(record))
        })
    }

    fn find_by_id(
        &self,
        id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned())
        })
    }

    fn find_by_request(
        &self,
        policy_id: PolicyId,
        request_id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        let request_id = request_id.clone();
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.policy_id == policy_id && r.request_id == request_id)
                .cloned())
        })
    }

    fn update_status(
        &self,
        id: ReservationId,
        change: StatusChange,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationRecord, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(LedgerError::NotFound(id))?;
            if record.status != change.expected {
                return Err(LedgerError::StatusConflict {
                    id,
                    expected: change.expected,
                    actual: record.status,
                });
            }
            record.status = change.next;
            record.order_id = change.order_id;
            record.used_at = change.used_at;
            Ok(record.clone())
        })
    }

    fn active_units(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.policy_id == policy_id && r.status.consumes_inventory())
                .map(|r| u64::from(r.quantity))
                .sum())
        })
    }

    fn list_by_requester(
        &self,
        requester_id: RequesterId,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_read()?;
            let mut matching: Vec<ReservationRecord> = self
                .records
                .lock()
                .unwrap()
                .iter()
                .rev()
                .filter(|r| r.requester_id == requester_id)
                .filter(|r| status.is_none_or(|s| r.status == s))
                .cloned()
                .collect();
            // Stable sort keeps later insertions first among equal timestamps
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            Ok(matching
                .into_iter()
                .skip(offset)
                .take(page.size as usize)
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::epoch;
    use chrono::Duration as ChronoDuration;
    use reservation_core::{FailureReason, ReservationIntent};

    fn rid(s: &str) -> RequestId {
        RequestId::parse(s).unwrap()
    }

    fn record(policy: i64, requester: i64, request: &str, minutes: i64) -> ReservationRecord {
        let intent = ReservationIntent {
            request_id: rid(request),
            policy_id: PolicyId::new(policy),
            requester_id: RequesterId::new(requester),
            quantity: 1,
            submitted_at: epoch(),
        };
        ReservationRecord::issue(&intent, epoch() + ChronoDuration::minutes(minutes))
    }

    #[tokio::test]
    async fn terminal_outcome_is_write_once() {
        let store = InMemoryResultStore::new();
        let ttl = Duration::from_secs(60);
        let pending = OutcomeRecord::pending(rid("a"), epoch());
        assert!(store.claim(&pending, ttl).await.unwrap().is_none());
        assert_eq!(store.claim(&pending, ttl).await.unwrap(), Some(pending));

        let success = OutcomeRecord::success(rid("a"), ReservationId::new(), epoch());
        assert_eq!(store.complete(&success, ttl).await.unwrap(), success);

        let failure = OutcomeRecord::failure(rid("a"), FailureReason::Exhausted, epoch());
        assert_eq!(store.complete(&failure, ttl).await.unwrap(), success);

        store.abandon(&rid("a")).await.unwrap();
        assert_eq!(store.get(&rid("a")).await.unwrap(), Some(success));
    }

    #[tokio::test]
    async fn abandon_removes_only_pending() {
        let store = InMemoryResultStore::new();
        let ttl = Duration::from_secs(60);
        store
            .claim(&OutcomeRecord::pending(rid("a"), epoch()), ttl)
            .await
            .unwrap();
        store.abandon(&rid("a")).await.unwrap();
        assert!(store.get(&rid("a")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_expire() {
        let store = InMemoryResultStore::new();
        store
            .claim(&OutcomeRecord::pending(rid("a"), epoch()), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(&rid("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ledger_is_unique_per_policy_and_request() {
        let ledger = InMemoryLedger::new();
        let first = record(1, 7, "a", 0);
        assert!(matches!(
            ledger.insert_if_absent(&first).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        let again = record(1, 7, "a", 1);
        let outcome = ledger.insert_if_absent(&again).await.unwrap();
        assert_eq!(outcome.into_record().id, first.id);

        // Same request id under another policy is a different reservation
        let other = record(2, 7, "a", 0);
        assert!(matches!(
            ledger.insert_if_absent(&other).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(ledger.active_units(PolicyId::new(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_status_is_compare_and_set() {
        let ledger = InMemoryLedger::new();
        let r = record(1, 7, "a", 0);
        ledger.insert_if_absent(&r).await.unwrap();

        let change = StatusChange {
            expected: ReservationStatus::Available,
            next: ReservationStatus::Used,
            order_id: None,
            used_at: Some(epoch()),
        };
        ledger.update_status(r.id, change.clone()).await.unwrap();
        assert!(matches!(
            ledger.update_status(r.id, change).await,
            Err(LedgerError::StatusConflict {
                actual: ReservationStatus::Used,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let ledger = InMemoryLedger::new();
        for (i, request) in ["a", "b", "c"].into_iter().enumerate() {
            ledger
                .insert_if_absent(&record(1, 7, request, i64::try_from(i).unwrap()))
                .await
                .unwrap();
        }
        ledger.insert_if_absent(&record(1, 8, "z", 9)).await.unwrap();

        let first_page = ledger
            .list_by_requester(RequesterId::new(7), None, Page::new(0, 2))
            .await
            .unwrap();
        let ids: Vec<_> = first_page.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);

        let second_page = ledger
            .list_by_requester(RequesterId::new(7), None, Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].request_id.as_str(), "a");
    }
}
