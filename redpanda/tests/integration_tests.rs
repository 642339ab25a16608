//! Integration tests for [`RedpandaIssuanceQueue`] with a real Kafka-compatible broker.
//!
//! These tests use testcontainers to spin up a broker and validate:
//! - Publish/subscribe round-trip of intents
//! - Redelivery of an unacknowledged delivery with a higher attempt
//! - Committed deliveries are not seen again by a new consumer of the group
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they require Docker and take 15-60 seconds each:
//! ```bash
//! cargo test -p reservation-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use reservation_core::queue::{Delivery, DeliveryStream, IssuanceQueue};
use reservation_core::{PolicyId, RequestId, RequesterId, ReservationIntent, Utc};
use reservation_redpanda::RedpandaIssuanceQueue;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn intent(request_id: &str) -> ReservationIntent {
    ReservationIntent {
        request_id: RequestId::parse(request_id).unwrap(),
        policy_id: PolicyId::new(1),
        requester_id: RequesterId::new(42),
        quantity: 1,
        submitted_at: Utc::now(),
    }
}

async fn start_broker() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Build a queue and publish a warmup intent until the topic exists.
async fn ready_queue(brokers: &str, topic: &str, group: &str) -> RedpandaIssuanceQueue {
    let queue = RedpandaIssuanceQueue::builder()
        .brokers(brokers)
        .topic(topic)
        .consumer_group(group)
        .redelivery_delay(Duration::from_millis(100))
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create queue");

    for attempt in 1..=60 {
        if queue.publish(&intent("warmup")).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return queue;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Broker failed to become ready");
    }
    unreachable!()
}

/// Next non-warmup delivery, within a deadline.
async fn next_delivery(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("delivery failed");
            if delivery.intent.request_id.as_str() == "warmup" {
                delivery.ack();
                continue;
            }
            return delivery;
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn published_intent_is_delivered() {
    let (_kafka, brokers) = start_broker().await;
    let queue = ready_queue(&brokers, "intents-round-trip", "round-trip").await;
    let mut stream = queue.subscribe("worker-0").await.expect("Failed to subscribe");

    let sent = intent("req-1");
    queue.publish(&sent).await.expect("Failed to publish");

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.intent, sent);
    assert_eq!(delivery.attempt, 1);
    delivery.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacknowledged_delivery_comes_back() {
    let (_kafka, brokers) = start_broker().await;
    let queue = ready_queue(&brokers, "intents-redelivery", "redelivery").await;
    let mut stream = queue.subscribe("worker-0").await.expect("Failed to subscribe");

    queue.publish(&intent("req-1")).await.expect("Failed to publish");
    queue.publish(&intent("req-2")).await.expect("Failed to publish");

    let first = next_delivery(&mut stream).await;
    assert_eq!(first.intent.request_id.as_str(), "req-1");
    drop(first);

    // The same intent again, before anything published after it
    let again = next_delivery(&mut stream).await;
    assert_eq!(again.intent.request_id.as_str(), "req-1");
    assert_eq!(again.attempt, 2);
    again.ack();

    let second = next_delivery(&mut stream).await;
    assert_eq!(second.intent.request_id.as_str(), "req-2");
    second.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn acknowledged_intents_are_committed_for_the_group() {
    let (_kafka, brokers) = start_broker().await;
    let queue = ready_queue(&brokers, "intents-commit", "commit").await;

    {
        let mut stream = queue.subscribe("worker-0").await.expect("Failed to subscribe");
        queue.publish(&intent("req-1")).await.expect("Failed to publish");
        next_delivery(&mut stream).await.ack();
        // Let the async commit land before the consumer leaves the group
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    let mut stream = queue.subscribe("worker-1").await.expect("Failed to resubscribe");
    queue.publish(&intent("req-2")).await.expect("Failed to publish");

    let delivery = next_delivery(&mut stream).await;
    assert_eq!(delivery.intent.request_id.as_str(), "req-2");
    delivery.ack();
}
