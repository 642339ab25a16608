//! Read access to resource policies.

use crate::types::{PolicyId, ResourcePolicy};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while loading policies.
#[derive(Error, Debug, Clone)]
pub enum PolicyStoreError {
    /// Failed to reach the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A stored policy violates its own invariants
    #[error("Policy {policy_id} is invalid: {reason}")]
    Invalid {
        /// The offending policy
        policy_id: PolicyId,
        /// What is wrong with it
        reason: String,
    },

    /// Generic backend failure
    #[error("Policy store backend error: {0}")]
    Backend(String),
}

/// Source of [`ResourcePolicy`] definitions. Read-only from the engine's side.
pub trait PolicyStore: Send + Sync {
    /// Load a policy by id. `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyStoreError`] if the store is unreachable.
    fn get_policy(
        &self,
        policy_id: PolicyId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ResourcePolicy>, PolicyStoreError>> + Send + '_>>;
}
