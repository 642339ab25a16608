//! Reservation lifecycle after issuance, and policy activation.
//!
//! ```text
//! Available ──use──► Used ──cancel──► Cancelled
//! ```
//!
//! The requester is an explicit argument of every operation; there is no ambient
//! "current user". Whether cancelling returns units to the shared counter is a
//! configured [`CancellationPolicy`].

use crate::backends::Backends;
use crate::config::{CancellationPolicy, LifecycleConfig};
use crate::coordinator::compensate;
use crate::retry::RetryPolicy;
use reservation_core::counter::CounterError;
use reservation_core::ledger::{LedgerError, Page, StatusChange};
use reservation_core::policy::PolicyStoreError;
use reservation_core::{
    OrderId, PolicyId, RequesterId, ReservationId, ReservationRecord, ReservationStatus,
    ResourcePolicy,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from lifecycle operations.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// No such reservation
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    /// The reservation belongs to another requester
    #[error("reservation {id} does not belong to requester {requester_id}")]
    NotOwner {
        /// The reservation
        id: ReservationId,
        /// The caller
        requester_id: RequesterId,
    },

    /// The reservation was already redeemed
    #[error("reservation {0} is already used")]
    AlreadyUsed(ReservationId),

    /// Only used reservations can be cancelled
    #[error("reservation {0} is not used")]
    NotUsed(ReservationId),

    /// The reservation is not redeemable in its current status
    #[error("reservation {id} is {status}")]
    NotAvailable {
        /// The reservation
        id: ReservationId,
        /// Its status
        status: ReservationStatus,
    },

    /// The policy window does not contain now
    #[error("policy {0} is outside its validity window")]
    Expired(PolicyId),

    /// The policy does not exist
    #[error("policy {0} not found")]
    PolicyNotFound(PolicyId),

    /// The ledger failed
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    /// The policy store failed
    #[error("policy store: {0}")]
    Policy(#[from] PolicyStoreError),

    /// The shared counter failed
    #[error("counter: {0}")]
    Counter(#[from] CounterError),
}

/// Redeem, cancel and list issued reservations.
#[derive(Clone, Debug)]
pub struct ReservationLifecycle {
    backends: Backends,
    config: LifecycleConfig,
    restore_retry: RetryPolicy,
}

impl ReservationLifecycle {
    /// Create the lifecycle service.
    #[must_use]
    pub fn new(backends: Backends, config: LifecycleConfig) -> Self {
        Self {
            backends,
            config,
            restore_retry: RetryPolicy::default(),
        }
    }

    /// Redeem an available reservation against an order.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::NotFound`] / [`LifecycleError::NotOwner`]
    /// - [`LifecycleError::AlreadyUsed`] if it was redeemed before
    /// - [`LifecycleError::Expired`] if the policy window has closed
    pub async fn use_reservation(
        &self,
        id: ReservationId,
        requester_id: RequesterId,
        order_id: OrderId,
    ) -> Result<ReservationRecord, LifecycleError> {
        let record = self.owned(id, requester_id).await?;
        match record.status {
            ReservationStatus::Available => {}
            ReservationStatus::Used => return Err(LifecycleError::AlreadyUsed(id)),
            status => return Err(LifecycleError::NotAvailable { id, status }),
        }

        let policy = self.policy(record.policy_id).await?;
        let now = self.backends.clock.now();
        if !policy.is_active_at(now) {
            return Err(LifecycleError::Expired(policy.id));
        }

        let change = StatusChange {
            expected: ReservationStatus::Available,
            next: ReservationStatus::Used,
            order_id: Some(order_id),
            used_at: Some(now),
        };
        let updated = self
            .backends
            .ledger
            .update_status(id, change)
            .await
            .map_err(|e| match e {
                LedgerError::StatusConflict {
                    actual: ReservationStatus::Used,
                    ..
                } => LifecycleError::AlreadyUsed(id),
                other => other.into(),
            })?;

        info!(reservation_id = %id, %requester_id, %order_id, "Reservation used");
        Ok(updated)
    }

    /// Reverse a redemption.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::NotFound`] / [`LifecycleError::NotOwner`]
    /// - [`LifecycleError::NotUsed`] unless the reservation is `Used`
    pub async fn cancel(
        &self,
        id: ReservationId,
        requester_id: RequesterId,
    ) -> Result<ReservationRecord, LifecycleError> {
        let record = self.owned(id, requester_id).await?;
        if record.status != ReservationStatus::Used {
            return Err(LifecycleError::NotUsed(id));
        }

        let change = StatusChange {
            expected: ReservationStatus::Used,
            next: ReservationStatus::Cancelled,
            order_id: None,
            used_at: None,
        };
        let updated = self
            .backends
            .ledger
            .update_status(id, change)
            .await
            .map_err(|e| match e {
                LedgerError::StatusConflict { .. } => LifecycleError::NotUsed(id),
                other => other.into(),
            })?;

        if self.config.cancellation == CancellationPolicy::RestoreInventory {
            compensate(
                &*self.backends.counter,
                updated.policy_id,
                i64::from(updated.quantity),
                &self.restore_retry,
            )
            .await;
        }

        info!(
            reservation_id = %id,
            %requester_id,
            cancellation = ?self.config.cancellation,
            "Reservation cancelled"
        );
        Ok(updated)
    }

    /// A requester's reservations, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Ledger`] if the ledger is unreachable.
    pub async fn list(
        &self,
        requester_id: RequesterId,
        status: Option<ReservationStatus>,
        page: Page,
    ) -> Result<Vec<ReservationRecord>, LifecycleError> {
        Ok(self
            .backends
            .ledger
            .list_by_requester(requester_id, status, page)
            .await?)
    }

    async fn owned(
        &self,
        id: ReservationId,
        requester_id: RequesterId,
    ) -> Result<ReservationRecord, LifecycleError> {
        let record = self
            .backends
            .ledger
            .find_by_id(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))?;
        if record.requester_id != requester_id {
            return Err(LifecycleError::NotOwner { id, requester_id });
        }
        Ok(record)
    }

    async fn policy(&self, policy_id: PolicyId) -> Result<ResourcePolicy, LifecycleError> {
        self.backends
            .policies
            .get_policy(policy_id)
            .await?
            .ok_or(LifecycleError::PolicyNotFound(policy_id))
    }
}

/// Result of activating a policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    /// The policy
    pub policy_id: PolicyId,
    /// Whether this call created the counter
    pub initialized: bool,
    /// Counter value after the call
    pub remaining: Option<i64>,
}

/// Creates the shared counter for a policy.
#[derive(Clone, Debug)]
pub struct PolicyActivator {
    backends: Backends,
}

impl PolicyActivator {
    /// Create an activator.
    #[must_use]
    pub const fn new(backends: Backends) -> Self {
        Self { backends }
    }

    /// Initialize the policy's counter, expiring when its window closes.
    ///
    /// The initial value is the total quantity minus units already recorded in the
    /// ledger, so re-activating after the counter was lost cannot re-issue them.
    /// Idempotent: an existing counter is never reset.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::PolicyNotFound`] for an unknown policy
    /// - [`LifecycleError::Expired`] once the window has closed
    pub async fn activate(&self, policy_id: PolicyId) -> Result<Activation, LifecycleError> {
        let policy = self
            .backends
            .policies
            .get_policy(policy_id)
            .await?
            .ok_or(LifecycleError::PolicyNotFound(policy_id))?;

        let now = self.backends.clock.now();
        let ttl = match (policy.valid_until - now).to_std() {
            Ok(ttl) if !ttl.is_zero() => ttl,
            _ => return Err(LifecycleError::Expired(policy_id)),
        };

        let issued = self.backends.ledger.active_units(policy_id).await?;
        let total = u64::from(policy.total_quantity);
        let initial = i64::try_from(total.saturating_sub(issued)).unwrap_or(0);
        if issued > 0 {
            warn!(%policy_id, issued, "Activating a policy that already has issued units");
        }

        let initialized = self
            .backends
            .counter
            .initialize(policy_id, initial, Some(ttl))
            .await?;
        let remaining = self.backends.counter.get(policy_id).await?;

        info!(%policy_id, initialized, ?remaining, ttl_secs = ttl.as_secs(), "Policy activated");
        Ok(Activation {
            policy_id,
            initialized,
            remaining,
        })
    }
}
