//! Issuance workers: drain the queue into the ledger and publish outcomes.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe (shared consumer group)
//!     for each delivery:
//!         process intent     ── idempotent, keyed by (policy, request id)
//!         write outcome      ── write-once
//!         ack                ── only after the outcome is stored
//!     stream ended or subscription failed:
//!         wait retry_delay, resubscribe
//! }
//! ```
//!
//! A worker that crashes between the ledger write and the ack relies on redelivery;
//! the second delivery finds the existing record and republishes the same outcome.

use crate::backends::Backends;
use crate::config::WorkerConfig;
use crate::metrics::IssuanceMetrics;
use crate::retry::{retry_with_backoff, retry_with_predicate};
use futures::StreamExt;
use reservation_core::ledger::{InsertOutcome, LedgerError};
use reservation_core::outcome::ResultStoreError;
use reservation_core::policy::PolicyStoreError;
use reservation_core::queue::{Delivery, DeliveryStream, IssuanceQueue};
use reservation_core::{
    FailureReason, OutcomeRecord, ReservationId, ReservationIntent, ReservationRecord,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Faults that leave a delivery unacknowledged for redelivery.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The outcome could not be stored
    #[error("result store: {0}")]
    Results(#[from] ResultStoreError),

    /// The policy could not be loaded
    #[error("policy store: {0}")]
    Policy(#[from] PolicyStoreError),
}

/// What processing an intent produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuanceResult {
    /// A new record was written
    Issued(ReservationId),
    /// A record for this request already existed
    Duplicate(ReservationId),
    /// The intent will never produce a record
    Failed(FailureReason),
}

/// Turns intents into durable records.
pub struct IssuanceWorker {
    backends: Backends,
    config: WorkerConfig,
}

impl IssuanceWorker {
    /// Create a worker.
    #[must_use]
    pub const fn new(backends: Backends, config: WorkerConfig) -> Self {
        Self { backends, config }
    }

    /// Process one intent and publish its outcome.
    ///
    /// Idempotent: processing the same intent again yields the same record and never
    /// replaces a stored terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the outcome cannot be stored or the policy cannot
    /// be read; the intent should then be redelivered.
    pub async fn process(&self, intent: &ReservationIntent) -> Result<IssuanceResult, WorkerError> {
        let result = match self.persist(intent).await? {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    policy_id = %intent.policy_id,
                    request_id = %intent.request_id,
                    requester_id = %intent.requester_id,
                    quantity = intent.quantity,
                    error = %e,
                    "Persistence failed after retries, units stay consumed"
                );
                IssuanceResult::Failed(FailureReason::PersistenceFailure {
                    detail: e.to_string(),
                })
            }
        };

        let now = self.backends.clock.now();
        let record = match &result {
            IssuanceResult::Issued(id) | IssuanceResult::Duplicate(id) => {
                OutcomeRecord::success(intent.request_id.clone(), *id, now)
            }
            IssuanceResult::Failed(reason) => {
                OutcomeRecord::failure(intent.request_id.clone(), reason.clone(), now)
            }
        };
        let stored = self
            .backends
            .results
            .complete(&record, self.config.outcome_ttl)
            .await?;
        if stored != record {
            debug!(
                request_id = %intent.request_id,
                stored = ?stored.status,
                "Earlier terminal outcome kept"
            );
        }

        match &result {
            IssuanceResult::Issued(id) => {
                IssuanceMetrics::record_issued();
                info!(request_id = %intent.request_id, reservation_id = %id, "Reservation issued");
            }
            IssuanceResult::Duplicate(id) => {
                IssuanceMetrics::record_duplicate();
                debug!(request_id = %intent.request_id, reservation_id = %id, "Duplicate delivery");
            }
            IssuanceResult::Failed(reason) => IssuanceMetrics::record_failed(reason.code()),
        }
        Ok(result)
    }

    /// Process a delivery and acknowledge it once its outcome is stored.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] without acknowledging; the queue redelivers.
    pub async fn handle(&self, delivery: Delivery) -> Result<IssuanceResult, WorkerError> {
        if delivery.attempt > 1 {
            debug!(
                request_id = %delivery.intent.request_id,
                attempt = delivery.attempt,
                "Redelivered intent"
            );
        }
        let result = self.process(&delivery.intent).await?;
        delivery.ack();
        Ok(result)
    }

    /// The ledger part of processing. The inner error is a persistence failure.
    async fn persist(
        &self,
        intent: &ReservationIntent,
    ) -> Result<Result<IssuanceResult, LedgerError>, WorkerError> {
        let ledger = &*self.backends.ledger;
        let retry = &self.config.persistence_retry;

        let existing = retry_with_predicate(
            retry,
            || ledger.find_by_request(intent.policy_id, &intent.request_id),
            LedgerError::is_transient,
        )
        .await;
        match existing {
            Ok(Some(record)) => return Ok(Ok(IssuanceResult::Duplicate(record.id))),
            Ok(None) => {}
            Err(e) => return Ok(Err(e)),
        }

        let policies = &*self.backends.policies;
        let policy = retry_with_backoff(retry, || policies.get_policy(intent.policy_id)).await?;
        if policy.is_none() {
            warn!(policy_id = %intent.policy_id, request_id = %intent.request_id, "Policy vanished");
            return Ok(Ok(IssuanceResult::Failed(FailureReason::PolicyNotFound)));
        }

        let record = ReservationRecord::issue(intent, self.backends.clock.now());
        let inserted = retry_with_predicate(
            retry,
            || ledger.insert_if_absent(&record),
            LedgerError::is_transient,
        )
        .await;
        Ok(inserted.map(|outcome| match outcome {
            InsertOutcome::Inserted(stored) => IssuanceResult::Issued(stored.id),
            InsertOutcome::AlreadyExists(existing) => IssuanceResult::Duplicate(existing.id),
        }))
    }
}

/// One queue consumer running the subscribe-process-reconnect loop.
pub struct IssuanceConsumer {
    name: String,
    queue: Arc<dyn IssuanceQueue>,
    worker: Arc<IssuanceWorker>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl IssuanceConsumer {
    /// Create a consumer with the default retry delay (5 seconds).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn IssuanceQueue>,
        worker: Arc<IssuanceWorker>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            worker,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set the delay before resubscribing.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run the consumer on a background task.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Issuance consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Issuance consumer received shutdown signal");
                    break;
                }
                subscribed = self.queue.subscribe(&self.name) => {
                    match subscribed {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, "Subscribed to issuance queue");
                            if self.process_stream(&mut stream).await.is_break() {
                                break;
                            }
                            warn!(
                                consumer = %self.name,
                                "Delivery stream ended, resubscribing in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(consumer = %self.name, "Issuance consumer stopped");
    }

    /// Drain the stream until it ends (`Continue`) or shutdown is signalled (`Break`).
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> std::ops::ControlFlow<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Shutdown signal received during processing");
                    return std::ops::ControlFlow::Break(());
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            // Not raced against shutdown: a started write runs to completion.
                            if let Err(e) = self.worker.handle(delivery).await {
                                error!(
                                    consumer = %self.name,
                                    error = %e,
                                    "Failed to process intent, leaving it for redelivery"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Error receiving delivery");
                        }
                        None => return std::ops::ControlFlow::Continue(()),
                    }
                }
            }
        }
    }
}

/// A fixed-size pool of issuance consumers sharing one consumer group.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` consumers. They stop when `shutdown` fires.
    #[must_use]
    pub fn spawn(
        queue: &Arc<dyn IssuanceQueue>,
        worker: &Arc<IssuanceWorker>,
        config: &WorkerConfig,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let handles = (0..config.concurrency.max(1))
            .map(|index| {
                IssuanceConsumer::new(
                    format!("issuance-worker-{index}"),
                    Arc::clone(queue),
                    Arc::clone(worker),
                    shutdown.subscribe(),
                )
                .with_retry_delay(config.retry_delay)
                .spawn()
            })
            .collect::<Vec<_>>();
        info!(consumers = handles.len(), "Issuance worker pool started");
        Self { handles }
    }

    /// Number of consumers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no consumers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every consumer to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Issuance consumer task failed");
            }
        }
    }
}
