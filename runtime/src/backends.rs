//! The set of collaborators the engine runs against.

use reservation_core::counter::AtomicQuantityCache;
use reservation_core::environment::Clock;
use reservation_core::ledger::PersistentLedger;
use reservation_core::lock::DistributedLock;
use reservation_core::outcome::ResultStore;
use reservation_core::policy::PolicyStore;
use reservation_core::queue::IssuanceQueue;
use std::sync::Arc;

/// Shared handles to every collaborator.
///
/// Cheap to clone; each component picks the handles it needs. Swapping in-memory
/// implementations for Redis/Redpanda/PostgreSQL ones happens entirely here.
#[derive(Clone)]
pub struct Backends {
    /// Policy definitions
    pub policies: Arc<dyn PolicyStore>,
    /// Shared per-policy counter
    pub counter: Arc<dyn AtomicQuantityCache>,
    /// Per-policy admission lock
    pub lock: Arc<dyn DistributedLock>,
    /// Intent hand-off to the issuance workers
    pub queue: Arc<dyn IssuanceQueue>,
    /// Request outcomes
    pub results: Arc<dyn ResultStore>,
    /// Durable reservation records
    pub ledger: Arc<dyn PersistentLedger>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
