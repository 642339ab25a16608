//! Issuance queue abstraction.
//!
//! The [`IssuanceQueue`] carries accepted-but-not-yet-durable [`ReservationIntent`]s
//! from the coordinator to the issuance workers.
//!
//! # Delivery Semantics
//!
//! ```text
//! ┌─────────────────┐   publish    ┌───────────────┐   Delivery    ┌────────────────┐
//! │   Coordinator   │─────────────►│ IssuanceQueue │──────────────►│ IssuanceWorker │
//! └─────────────────┘              └───────────────┘               └───────┬────────┘
//!                                          ▲                               │
//!                                          └────────── ack ────────────────┘
//! ```
//!
//! - **At-least-once**: an intent is delivered one or more times, never zero
//! - **Acknowledge after processing**: a [`Delivery`] that is dropped without
//!   [`Delivery::ack`] is delivered again (now or after a restart/rebalance)
//! - **No ordering guarantee** beyond "eventually every intent reaches some worker"
//! - **Idempotency**: consumers must tolerate duplicates (the ledger's
//!   `(policy, request id)` uniqueness makes this safe)
//!
//! # Implementations
//!
//! - `InMemoryIssuanceQueue` (reservation-testing) - For testing, with redelivery
//! - `RedpandaIssuanceQueue` (reservation-redpanda) - For production (Kafka-compatible)

use crate::types::ReservationIntent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an intent
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// One delivery of an intent to a consumer.
///
/// Call [`Delivery::ack`] once the intent has been fully processed. Dropping the
/// delivery without acknowledging it leaves the intent eligible for redelivery.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered intent
    pub intent: ReservationIntent,
    /// 1 for the first delivery, incremented on each redelivery the queue knows about
    pub attempt: u32,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Create a delivery with an acknowledgement channel.
    ///
    /// The queue implementation keeps the receiving half and commits (or forgets) the
    /// message once it resolves; a receive error means "not acknowledged".
    #[must_use]
    pub fn new(intent: ReservationIntent, attempt: u32) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                intent,
                attempt,
                ack: Some(tx),
            },
            rx,
        )
    }

    /// Create a delivery that needs no acknowledgement.
    #[must_use]
    pub const fn unacknowledged(intent: ReservationIntent, attempt: u32) -> Self {
        Self {
            intent,
            attempt,
            ack: None,
        }
    }

    /// Acknowledge successful processing.
    pub fn ack(mut self) {
        if let Some(tx) = self.ack.take() {
            // The queue may have given up on this delivery already; nothing to do then.
            let _ = tx.send(());
        }
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Trait for issuance queue implementations.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so it can be held as
/// `Arc<dyn IssuanceQueue>`.
pub trait IssuanceQueue: Send + Sync {
    /// Publish an admitted intent.
    ///
    /// Publishing is bounded: implementations must time out rather than block the
    /// admission path indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] if the intent could not be enqueued.
    fn publish(
        &self,
        intent: &ReservationIntent,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Subscribe as one consumer of the shared consumer group.
    ///
    /// Several subscriptions share the intents between them; each intent is processed
    /// by at least one of them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the subscription fails.
    fn subscribe(
        &self,
        consumer_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{PolicyId, RequestId, RequesterId};
    use chrono::Utc;

    fn intent() -> ReservationIntent {
        ReservationIntent {
            request_id: RequestId::parse("req-1").unwrap(),
            policy_id: PolicyId::new(1),
            requester_id: RequesterId::new(7),
            quantity: 1,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ack_resolves_receiver() {
        let (delivery, rx) = Delivery::new(intent(), 1);
        delivery.ack();
        tokio_test::assert_ok!(rx.await);
    }

    #[tokio::test]
    async fn dropped_delivery_is_not_acknowledged() {
        let (delivery, rx) = Delivery::new(intent(), 1);
        drop(delivery);
        tokio_test::assert_err!(rx.await);
    }
}
