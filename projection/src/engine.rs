//! The projection engine: from bus deliveries to committed read models.
//!
//! # Topology
//!
//! A router task pulls deliveries from the subscription and routes each one
//! to a worker chosen by hashing the aggregate ID, so all events of one
//! aggregate are processed by the same worker while distinct aggregates
//! proceed in parallel.
//!
//! # Checkpoint compare-and-apply
//!
//! Each delivery is processed in one query-store transaction against the
//! per-aggregate checkpoint:
//!
//! - `sequence <= checkpoint` — duplicate delivery, acked without writes
//! - `sequence == checkpoint + 1` — decode, run the transform, write the
//!   model and the advanced checkpoint together, commit, ack
//! - `sequence > checkpoint + 1` — gap, the delivery is nacked after an
//!   exponential backoff so the missing event has time to arrive
//!
//! Because the model write and the checkpoint advance share a transaction,
//! a crash at any point leaves the pair consistent and the redelivered
//! event is handled by the same comparison.
//!
//! # Failure handling
//!
//! Transient storage failures roll back and nack with backoff, forever.
//! Gaps, undecodable payloads, and transform failures also nack with
//! backoff, but once the delivery's attempt count reaches
//! [`EngineConfig::max_attempts`] the event is dead-lettered and acked so
//! the rest of the stream keeps flowing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use dualis_core::bus::{Delivery, Subscription};
use dualis_core::clock::Clock;
use dualis_core::event::SequenceNumber;
use dualis_core::keys;
use dualis_core::projection::{Applied, Checkpoint, ProjectionTransform, TransformError};
use dualis_core::store::{StoreError, Transaction, TransactionalStore};

use crate::dead_letter::DeadLetterQueue;
use crate::retry::RetryPolicy;

/// Errors from applying one delivery to a projection.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// The delivery's sequence is ahead of the checkpoint by more than one.
    #[error("Sequence gap: expected {expected}, found {found}")]
    Gap {
        /// The sequence the checkpoint admits next.
        expected: SequenceNumber,
        /// The sequence that was delivered.
        found: SequenceNumber,
    },

    /// The payload or the stored model could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The transform rejected the event.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The query store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// The stored checkpoint could not be decoded.
    #[error("Corrupt checkpoint: {0}")]
    Checkpoint(String),
}

impl ProjectionError {
    /// Whether retrying could ever succeed without outside intervention.
    const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks. Aggregates are hash-partitioned across them.
    pub workers: usize,
    /// Bounded depth of each worker's delivery queue.
    pub worker_queue_depth: usize,
    /// Delivery attempts before a non-transient failure is dead-lettered.
    pub max_attempts: u32,
    /// Backoff applied before nacking a failed delivery.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            worker_queue_depth: 64,
            max_attempts: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs one projection transform against a subscription.
///
/// # Example
///
/// ```ignore
/// let (engine, shutdown) = ProjectionEngine::new(OrderProjection, query_store, clock);
/// let subscription = bus.subscribe("order-summary").await?;
/// let task = tokio::spawn(engine.run(subscription));
///
/// // ... later ...
/// shutdown.send(true).ok();
/// task.await?;
/// ```
pub struct ProjectionEngine<T: ProjectionTransform> {
    transform: Arc<T>,
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    shutdown: watch::Receiver<bool>,
}

impl<T: ProjectionTransform> ProjectionEngine<T> {
    /// Create an engine over the query store.
    ///
    /// Returns the engine and a shutdown sender; send `true` to stop it
    /// after in-flight deliveries finish.
    #[must_use]
    pub fn new(
        transform: T,
        store: Arc<dyn TransactionalStore>,
        clock: Arc<dyn Clock>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Self {
            transform: Arc::new(transform),
            store,
            clock,
            config: EngineConfig::default(),
            shutdown: shutdown_rx,
        };
        (engine, shutdown_tx)
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Consume the subscription until it ends or shutdown is signalled.
    ///
    /// Deliveries already handed to workers are processed to completion
    /// before this returns.
    pub async fn run(mut self, subscription: Arc<dyn Subscription>) {
        let worker_count = self.config.workers.max(1);
        let name = self.transform.name();
        tracing::info!(projection = name, workers = worker_count, "Projection engine started");

        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel::<Delivery>(self.config.worker_queue_depth);
            let worker = Worker {
                transform: Arc::clone(&self.transform),
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                subscription: Arc::clone(&subscription),
                dead_letters: DeadLetterQueue::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                ),
                max_attempts: self.config.max_attempts,
                retry: self.config.retry.clone(),
                index,
            };
            handles.push(tokio::spawn(worker.run(rx)));
            senders.push(tx);
        }

        let mut shutdown_open = true;
        loop {
            tokio::select! {
                delivery = subscription.next() => {
                    let Some(delivery) = delivery else { break };
                    let slot = route(delivery.aggregate_id().as_str(), worker_count);
                    if senders[slot].send(delivery).await.is_err() {
                        // Worker panicked; stop routing rather than drop
                        // deliveries silently.
                        tracing::error!(projection = name, slot, "Projection worker gone");
                        break;
                    }
                }
                changed = self.shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *self.shutdown.borrow() => break,
                        Ok(()) => {}
                        // Sender dropped without signalling; keep consuming.
                        Err(_) => shutdown_open = false,
                    }
                }
            }
        }

        drop(senders);
        for handle in handles {
            handle.await.ok();
        }
        tracing::info!(projection = name, "Projection engine stopped");
    }
}

/// Hash-partition an aggregate across `workers` slots.
fn route(aggregate_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

enum Outcome {
    Applied,
    Duplicate,
}

struct Worker<T: ProjectionTransform> {
    transform: Arc<T>,
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    subscription: Arc<dyn Subscription>,
    dead_letters: DeadLetterQueue,
    max_attempts: u32,
    retry: RetryPolicy,
    index: usize,
}

impl<T: ProjectionTransform> Worker<T> {
    async fn run(self, mut deliveries: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            self.handle(delivery).await;
        }
        tracing::debug!(
            projection = self.transform.name(),
            worker = self.index,
            "Projection worker drained"
        );
    }

    async fn handle(&self, delivery: Delivery) {
        let name = self.transform.name();

        match self.process(&delivery).await {
            Ok(Outcome::Applied) => {
                metrics::counter!("projection.applied", "projection" => name).increment(1);
                tracing::debug!(
                    projection = name,
                    aggregate_id = %delivery.aggregate_id(),
                    sequence = %delivery.envelope.sequence,
                    "Event applied"
                );
                self.settle(&delivery, true).await;
            }
            Ok(Outcome::Duplicate) => {
                metrics::counter!("projection.duplicate", "projection" => name).increment(1);
                tracing::debug!(
                    projection = name,
                    aggregate_id = %delivery.aggregate_id(),
                    sequence = %delivery.envelope.sequence,
                    "Duplicate delivery skipped"
                );
                self.settle(&delivery, true).await;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    projection = name,
                    aggregate_id = %delivery.aggregate_id(),
                    sequence = %delivery.envelope.sequence,
                    attempt = delivery.attempt,
                    error = %e,
                    "Transient failure, will redeliver"
                );
                self.backoff(delivery.attempt).await;
                self.settle(&delivery, false).await;
            }
            Err(e) => {
                if matches!(e, ProjectionError::Gap { .. }) {
                    metrics::counter!("projection.gap", "projection" => name).increment(1);
                }
                if delivery.attempt >= self.max_attempts {
                    self.dead_letter(&delivery, &e).await;
                } else {
                    tracing::warn!(
                        projection = name,
                        aggregate_id = %delivery.aggregate_id(),
                        sequence = %delivery.envelope.sequence,
                        attempt = delivery.attempt,
                        error = %e,
                        "Apply failed, will redeliver"
                    );
                    self.backoff(delivery.attempt).await;
                    self.settle(&delivery, false).await;
                }
            }
        }
    }

    /// Apply one delivery in a single transaction; any error rolls back,
    /// leaving model and checkpoint untouched.
    async fn process(&self, delivery: &Delivery) -> Result<Outcome, ProjectionError> {
        let mut tx = self.store.begin().await?;
        let result = self.apply_in_tx(tx.as_mut(), delivery).await;
        match result {
            Ok(Outcome::Applied) => {
                tx.commit().await?;
                Ok(Outcome::Applied)
            }
            Ok(Outcome::Duplicate) => {
                tx.rollback().await.ok();
                Ok(Outcome::Duplicate)
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn apply_in_tx(
        &self,
        tx: &mut dyn Transaction,
        delivery: &Delivery,
    ) -> Result<Outcome, ProjectionError> {
        let name = self.transform.name();
        let envelope = &delivery.envelope;

        let checkpoint_key = keys::checkpoint(name, &envelope.aggregate_id);
        let applied_up_to = match tx.get(&checkpoint_key).await? {
            Some(bytes) => {
                let checkpoint: Checkpoint = bincode::deserialize(&bytes)
                    .map_err(|e| ProjectionError::Checkpoint(e.to_string()))?;
                checkpoint.sequence.value()
            }
            None => 0,
        };

        let sequence = envelope.sequence.value();
        if sequence <= applied_up_to {
            return Ok(Outcome::Duplicate);
        }
        if sequence > applied_up_to + 1 {
            return Err(ProjectionError::Gap {
                expected: SequenceNumber::new(applied_up_to + 1),
                found: envelope.sequence,
            });
        }

        let event: T::Event = envelope
            .decode()
            .map_err(|e| ProjectionError::Decode(e.to_string()))?;

        let model_key = keys::read_model(name, &envelope.aggregate_id);
        let current: Option<T::Model> = match tx.get(&model_key).await? {
            Some(bytes) => Some(
                bincode::deserialize(&bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?,
            ),
            None => None,
        };

        match self.transform.apply(current, &event, envelope)? {
            Applied::Upsert(model) => {
                let bytes = bincode::serialize(&model)
                    .map_err(|e| ProjectionError::Decode(e.to_string()))?;
                tx.put(&model_key, bytes).await?;
            }
            Applied::Delete => tx.delete(&model_key).await?,
            Applied::Skip => {}
        }

        let checkpoint = Checkpoint::new(envelope.sequence, self.clock.now());
        let bytes = bincode::serialize(&checkpoint)
            .map_err(|e| ProjectionError::Checkpoint(e.to_string()))?;
        tx.put(&checkpoint_key, bytes).await?;

        Ok(Outcome::Applied)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &ProjectionError) {
        let name = self.transform.name();
        let recorded = self
            .dead_letters
            .record(name, &delivery.envelope, &error.to_string(), delivery.attempt)
            .await;
        match recorded {
            Ok(()) => {
                metrics::counter!("projection.dead_lettered", "projection" => name).increment(1);
                self.settle(delivery, true).await;
            }
            Err(record_error) => {
                // Could not even record the failure; keep the delivery alive.
                tracing::warn!(
                    projection = name,
                    aggregate_id = %delivery.aggregate_id(),
                    sequence = %delivery.envelope.sequence,
                    error = %record_error,
                    "Dead-letter write failed, will redeliver"
                );
                self.backoff(delivery.attempt).await;
                self.settle(delivery, false).await;
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self
            .retry
            .delay_for_attempt(attempt.saturating_sub(1) as usize);
        sleep(delay).await;
    }

    async fn settle(&self, delivery: &Delivery, acked: bool) {
        let result = if acked {
            self.subscription.ack(delivery.tag).await
        } else {
            self.subscription.nack(delivery.tag).await
        };
        if let Err(e) = result {
            tracing::warn!(
                projection = self.transform.name(),
                tag = %delivery.tag,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_and_in_range() {
        let slot = route("order-1", 4);
        assert_eq!(slot, route("order-1", 4));
        assert!(slot < 4);
        assert_eq!(route("anything", 1), 0);
    }
}
