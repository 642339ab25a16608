//! Redpanda issuance queue for the reservation engine.
//!
//! This crate provides a Kafka-compatible [`IssuanceQueue`] built on rdkafka. It
//! works against Redpanda, Apache Kafka, or any broker speaking the Kafka protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Coordinator   │  lock + decrement
//! └────────┬────────┘
//!          │ publish (bounded by timeout)
//!          ▼
//! ┌─────────────────┐
//! │    Redpanda     │  topic: reservation-intents
//! │  (key = policy) │
//! └────────┬────────┘
//!          │ consumer group
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌────────┐ ┌────────┐
//! │Worker 1│ │Worker 2│  idempotent ledger writes
//! └────────┘ └────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - An offset is committed only AFTER the worker acknowledges the [`Delivery`]
//! - A delivery dropped without acknowledgement rewinds its partition, so the
//!   intent is delivered again with `attempt + 1`
//! - If the process crashes before commit, intents are redelivered after rebalance
//! - Workers MUST be idempotent; the ledger's `(policy, request id)` uniqueness
//!   makes a duplicate write a no-op
//!
//! # Example
//!
//! ```no_run
//! use reservation_redpanda::RedpandaIssuanceQueue;
//! use reservation_core::queue::IssuanceQueue;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaIssuanceQueue::builder()
//!     .brokers("localhost:9092")
//!     .topic("reservation-intents")
//!     .consumer_group("reservation-issuance")
//!     .build()?;
//!
//! let mut deliveries = queue.subscribe("worker-0").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Issuing for {}", delivery.intent.request_id);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod tracker;

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::Offset;
use rdkafka::util::Timeout;
use reservation_core::ReservationIntent;
use reservation_core::queue::{Delivery, DeliveryStream, IssuanceQueue, QueueError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracker::{Admit, DeliveryTracker};

/// Default topic carrying reservation intents.
pub const DEFAULT_TOPIC: &str = "reservation-intents";

/// Default consumer group shared by all issuance workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "reservation-issuance";

/// Redpanda-backed issuance queue.
///
/// Intents are JSON-encoded and keyed by policy id, so intents for one policy
/// land on one partition. Every call to [`IssuanceQueue::subscribe`] creates a
/// consumer in the shared consumer group; partitions are balanced across them.
///
/// # Example
///
/// ```no_run
/// use reservation_redpanda::RedpandaIssuanceQueue;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaIssuanceQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaIssuanceQueue {
    /// Kafka producer for publishing intents
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    topic: String,
    consumer_group: String,
    /// Bound on a single publish, and on seek calls
    timeout: Duration,
    auto_offset_reset: String,
    /// Pause before an unacknowledged delivery is handed out again
    redelivery_delay: Duration,
}

impl RedpandaIssuanceQueue {
    /// Create a queue with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaIssuanceQueueBuilder {
        RedpandaIssuanceQueueBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The topic intents are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn create_consumer(&self, consumer_name: &str) -> Result<StreamConsumer, QueueError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.consumer_group)
            .set("client.id", consumer_name)
            .set("enable.auto.commit", "false") // Committed after acknowledgement
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| QueueError::SubscriptionFailed {
                topic: self.topic.clone(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| QueueError::SubscriptionFailed {
                topic: self.topic.clone(),
                reason: format!("Failed to subscribe to topic: {e}"),
            })?;

        Ok(consumer)
    }
}

/// Builder for configuring a [`RedpandaIssuanceQueue`].
#[derive(Default)]
pub struct RedpandaIssuanceQueueBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    redelivery_delay: Option<Duration>,
}

impl RedpandaIssuanceQueueBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the intent topic. Default: [`DEFAULT_TOPIC`].
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group shared by the workers. Default: [`DEFAULT_CONSUMER_GROUP`].
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. An admitted intent lost by the broker is a unit that is
    /// neither issued nor returned.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the publish timeout.
    ///
    /// Default: 2 seconds. Publishing happens while the policy lock is held, so
    /// this must stay well under the lock lease.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where a consumer group without committed offsets starts reading.
    ///
    /// Default: `"earliest"`, so intents published before the first worker joined
    /// are still issued.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the pause before an unacknowledged delivery is handed out again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = Some(delay);
        self
    }

    /// Build the [`RedpandaIssuanceQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaIssuanceQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(2));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let topic = self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %consumer_group,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaIssuanceQueue created"
        );

        Ok(RedpandaIssuanceQueue {
            producer,
            brokers,
            topic,
            consumer_group,
            timeout,
            auto_offset_reset,
            redelivery_delay: self.redelivery_delay.unwrap_or(Duration::from_secs(1)),
        })
    }
}

/// JSON payload of a published intent.
///
/// # Errors
///
/// Returns [`QueueError::PublishFailed`] if the intent cannot be serialized.
pub fn encode_intent(topic: &str, intent: &ReservationIntent) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(intent).map_err(|e| QueueError::PublishFailed {
        topic: topic.to_string(),
        reason: format!("Failed to serialize intent: {e}"),
    })
}

/// Decode a message payload back into an intent.
///
/// # Errors
///
/// Returns [`QueueError::DeserializationFailed`] on a missing or malformed payload.
pub fn decode_intent(payload: Option<&[u8]>) -> Result<ReservationIntent, QueueError> {
    let payload = payload
        .ok_or_else(|| QueueError::DeserializationFailed("Message has no payload".to_string()))?;
    serde_json::from_slice(payload)
        .map_err(|e| QueueError::DeserializationFailed(format!("Failed to deserialize intent: {e}")))
}

impl IssuanceQueue for RedpandaIssuanceQueue {
    fn publish(
        &self,
        intent: &ReservationIntent,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let intent = intent.clone();

        Box::pin(async move {
            let payload = encode_intent(&self.topic, &intent)?;
            // Keyed by policy so one policy's intents share a partition
            let key = intent.policy_id.to_string();

            let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

            match self
                .producer
                .send(record, Timeout::After(self.timeout))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        request_id = %intent.request_id,
                        policy_id = %intent.policy_id,
                        "Intent published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        request_id = %intent.request_id,
                        error = %kafka_error,
                        "Failed to publish intent"
                    );
                    Err(QueueError::PublishFailed {
                        topic: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        consumer_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let consumer_name = consumer_name.to_string();

        Box::pin(async move {
            let consumer = self.create_consumer(&consumer_name)?;

            tracing::info!(
                topic = %self.topic,
                consumer_group = %self.consumer_group,
                consumer = %consumer_name,
                manual_commit = true,
                "Subscribed to intents"
            );

            // One delivery in flight per subscription: offsets commit in order
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(forward_deliveries(
                consumer,
                tx,
                self.timeout,
                self.redelivery_delay,
            ));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Owns the consumer: hands out one delivery at a time and commits or rewinds
/// according to its acknowledgement. Exits when the subscriber goes away.
async fn forward_deliveries(
    consumer: StreamConsumer,
    tx: mpsc::Sender<Result<Delivery, QueueError>>,
    seek_timeout: Duration,
    redelivery_delay: Duration,
) {
    let mut tracker = DeliveryTracker::new();
    let mut stream = consumer.stream();

    while let Some(msg_result) = stream.next().await {
        let message = match msg_result {
            Ok(message) => message,
            Err(e) => {
                let err = QueueError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let (partition, offset) = (message.partition(), message.offset());
        let attempt = match tracker.admit(partition, offset) {
            Admit::Deliver { attempt } => attempt,
            Admit::Stale => continue,
        };

        let intent = match decode_intent(message.payload()) {
            Ok(intent) => intent,
            Err(e) => {
                // A malformed message can never succeed; commit it past so the
                // partition keeps moving
                tracing::error!(
                    topic = message.topic(),
                    partition,
                    offset,
                    error = %e,
                    "Skipping undecodable intent"
                );
                tracker.acknowledged(partition, offset);
                if let Err(commit_err) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(error = %commit_err, "Failed to commit undecodable message");
                }
                if tx.send(Err(e)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let (delivery, ack) = Delivery::new(intent, attempt);
        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!("Delivery receiver dropped, exiting consumer task");
            break; // exit WITHOUT committing
        }

        if ack.await.is_ok() {
            tracker.acknowledged(partition, offset);
            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                tracing::warn!(
                    topic = message.topic(),
                    partition,
                    offset,
                    error = %e,
                    "Failed to commit offset (intent may be redelivered)"
                );
            }
            continue;
        }

        if tx.is_closed() {
            break;
        }

        tracing::warn!(
            topic = message.topic(),
            partition,
            offset,
            attempt,
            "Delivery not acknowledged, rewinding for redelivery"
        );
        tokio::time::sleep(redelivery_delay).await;
        match consumer.seek(
            message.topic(),
            partition,
            Offset::Offset(offset),
            Timeout::After(seek_timeout),
        ) {
            Ok(()) => tracker.rewound(partition, offset),
            Err(e) => {
                // Nothing past the unacknowledged offset may be committed; end the
                // subscription so a fresh consumer resumes from the last commit
                tracing::error!(
                    topic = message.topic(),
                    partition,
                    offset,
                    error = %e,
                    "Failed to rewind partition, closing subscription"
                );
                break;
            },
        }
    }

    tracing::debug!(in_flight = tracker.in_flight(), "Consumer task exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reservation_core::{PolicyId, RequestId, RequesterId, Utc};

    fn intent() -> ReservationIntent {
        ReservationIntent {
            request_id: RequestId::parse("req-42").unwrap(),
            policy_id: PolicyId::new(3),
            requester_id: RequesterId::new(9),
            quantity: 2,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn redpanda_issuance_queue_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaIssuanceQueue>();
        assert_sync::<RedpandaIssuanceQueue>();
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaIssuanceQueue::builder().build(),
            Err(QueueError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn payload_carries_the_whole_intent() {
        let intent = intent();
        let payload = encode_intent(DEFAULT_TOPIC, &intent).unwrap();
        assert_eq!(decode_intent(Some(&payload)).unwrap(), intent);
    }

    #[test]
    fn missing_or_garbled_payload_is_a_decode_error() {
        assert!(matches!(
            decode_intent(None),
            Err(QueueError::DeserializationFailed(_))
        ));
        assert!(matches!(
            decode_intent(Some(b"not json")),
            Err(QueueError::DeserializationFailed(_))
        ));
    }
}
