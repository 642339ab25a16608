//! In-memory issuance queue with at-least-once redelivery.

use crate::fault::FaultSwitch;
use reservation_core::ReservationIntent;
use reservation_core::queue::{Delivery, DeliveryStream, IssuanceQueue, QueueError};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<VecDeque<(ReservationIntent, u32)>>,
    published: Mutex<Vec<ReservationIntent>>,
    notify: Notify,
}

impl Shared {
    fn push(&self, intent: ReservationIntent, attempt: u32) {
        self.pending.lock().unwrap().push_back((intent, attempt));
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<(ReservationIntent, u32)> {
        self.pending.lock().unwrap().pop_front()
    }

    /// Wait for the next intent; `None` once nothing else can push one.
    async fn next(self: &Arc<Self>) -> Option<(ReservationIntent, u32)> {
        loop {
            if let Some(entry) = self.pop() {
                return Some(entry);
            }
            if Arc::strong_count(self) == 1 {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// A single shared consumer group.
///
/// Every subscription pulls from the same queue, so each intent goes to one
/// consumer. A delivery dropped without [`Delivery::ack`] goes back to the end of
/// the queue with its attempt number incremented.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIssuanceQueue {
    shared: Arc<Shared>,
    publish_faults: FaultSwitch,
    subscribe_faults: FaultSwitch,
}

impl InMemoryIssuanceQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every intent ever published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<ReservationIntent> {
        self.shared.published.lock().unwrap().clone()
    }

    /// Intents waiting for a consumer, including redeliveries.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Put an intent back as if the broker redelivered it.
    pub fn redeliver(&self, intent: ReservationIntent, attempt: u32) {
        self.shared.push(intent, attempt);
    }

    /// Failure injection for `publish`.
    #[must_use]
    pub const fn publish_faults(&self) -> &FaultSwitch {
        &self.publish_faults
    }

    /// Failure injection for `subscribe`.
    #[must_use]
    pub const fn subscribe_faults(&self) -> &FaultSwitch {
        &self.subscribe_faults
    }
}

impl IssuanceQueue for InMemoryIssuanceQueue {
    fn publish(
        &self,
        intent: &ReservationIntent,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let intent = intent.clone();
        Box::pin(async move {
            if self.publish_faults.trip() {
                return Err(QueueError::PublishFailed {
                    topic: "in-memory".into(),
                    reason: "injected".into(),
                });
            }
            self.shared.published.lock().unwrap().push(intent.clone());
            self.shared.push(intent, 1);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        consumer_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let consumer_name = consumer_name.to_string();
        Box::pin(async move {
            if self.subscribe_faults.trip() {
                return Err(QueueError::SubscriptionFailed {
                    topic: "in-memory".into(),
                    reason: format!("injected for {consumer_name}"),
                });
            }

            let shared = Arc::clone(&self.shared);
            let stream = async_stream::stream! {
                while let Some((intent, attempt)) = shared.next().await {
                    let (delivery, acked) = Delivery::new(intent.clone(), attempt);
                    let requeue = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if acked.await.is_err() {
                            requeue.push(intent, attempt + 1);
                        }
                    });
                    yield Ok(delivery);
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use reservation_core::{PolicyId, RequestId, RequesterId};
    use std::time::Duration;

    fn intent(id: &str) -> ReservationIntent {
        ReservationIntent {
            request_id: RequestId::parse(id).unwrap(),
            policy_id: PolicyId::new(1),
            requester_id: RequesterId::new(1),
            quantity: 1,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unacknowledged_delivery_comes_back() {
        let queue = InMemoryIssuanceQueue::new();
        let mut stream = queue.subscribe("c1").await.unwrap();
        queue.publish(&intent("a")).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.intent.request_id.as_str(), "a");
        second.ack();
    }

    #[tokio::test]
    async fn consumers_share_the_queue() {
        let queue = InMemoryIssuanceQueue::new();
        let mut a = queue.subscribe("a").await.unwrap();
        let mut b = queue.subscribe("b").await.unwrap();
        queue.publish(&intent("1")).await.unwrap();
        queue.publish(&intent("2")).await.unwrap();

        let first = a.next().await.unwrap().unwrap();
        let second = b.next().await.unwrap().unwrap();
        assert_ne!(first.intent.request_id, second.intent.request_id);
        first.ack();
        second.ack();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.published().len(), 2);
    }

    #[tokio::test]
    async fn subscription_ends_once_the_queue_is_dropped() {
        let queue = InMemoryIssuanceQueue::new();
        let mut stream = queue.subscribe("c1").await.unwrap();
        drop(queue);

        assert!(stream.next().await.is_none());
    }
}
