//! Store-backed dead-letter queue for events a projection cannot apply.
//!
//! When the engine exhausts a delivery's retry budget it records the event
//! here and acks it, so one poisoned aggregate cannot stall the rest of the
//! stream. Entries are serialized as JSON so an operator can inspect them
//! with nothing but a key dump.
//!
//! The lifecycle is `pending` → `resolved` or `discarded`. [`requeue`]
//! hands the original envelope back to the bus once the blocker is fixed
//! (a deployed transform fix, a recovered upstream event) and marks the
//! entry resolved.
//!
//! [`requeue`]: DeadLetterQueue::requeue

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dualis_core::aggregate::AggregateId;
use dualis_core::bus::{DeliveryError, EventBus};
use dualis_core::clock::Clock;
use dualis_core::event::{EventEnvelope, SequenceNumber};
use dualis_core::keys;
use dualis_core::store::{self, StoreError, TransactionalStore};

use crate::retry::{RetryPolicy, retry_with_backoff};

/// Errors from dead-letter queue operations.
#[derive(Error, Debug)]
pub enum DeadLetterError {
    /// The query store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A stored entry could not be decoded.
    #[error("Corrupt dead-letter entry: {0}")]
    Decode(String),

    /// The addressed entry does not exist.
    #[error("No dead-letter entry for {projection}/{aggregate_id}/{sequence}")]
    NotFound {
        /// The projection the entry was expected under.
        projection: String,
        /// The aggregate of the missing entry.
        aggregate_id: AggregateId,
        /// The sequence of the missing entry.
        sequence: SequenceNumber,
    },

    /// Republishing to the bus failed.
    #[error("Republish failed: {0}")]
    Publish(#[from] DeliveryError),
}

/// Lifecycle state of a dead-letter entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Awaiting operator attention.
    Pending,
    /// Handled; the event was requeued or applied by other means.
    Resolved,
    /// Deliberately dropped; the event will never be applied.
    Discarded,
}

/// One event a projection gave up on, with enough context to diagnose it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The projection that failed to apply the event.
    pub projection: String,
    /// The original delivery, payload included.
    pub envelope: EventEnvelope,
    /// The last error message observed.
    pub error: String,
    /// Total delivery attempts before dead-lettering.
    pub attempts: u32,
    /// When the event first failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the event last failed.
    pub last_failed_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: DeadLetterStatus,
}

/// Dead-letter queue over the query store.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    /// Create a queue over the given query store.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a failed event, creating or updating its entry.
    ///
    /// Recording the same `(projection, aggregate, sequence)` again updates
    /// the error, attempts, and `last_failed_at` of the existing entry and
    /// resets it to pending.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] on storage failure or a corrupt entry.
    pub async fn record(
        &self,
        projection: &str,
        envelope: &EventEnvelope,
        error: &str,
        attempts: u32,
    ) -> Result<(), DeadLetterError> {
        let key = keys::dead_letter(projection, &envelope.aggregate_id, envelope.sequence);
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let staged = match tx.get(&key).await {
            Ok(existing) => {
                let entry = match existing {
                    Some(bytes) => {
                        let mut entry = decode_entry(&bytes)?;
                        entry.error = error.to_string();
                        entry.attempts = attempts;
                        entry.last_failed_at = now;
                        entry.status = DeadLetterStatus::Pending;
                        entry
                    }
                    None => DeadLetterEntry {
                        projection: projection.to_string(),
                        envelope: envelope.clone(),
                        error: error.to_string(),
                        attempts,
                        first_failed_at: now,
                        last_failed_at: now,
                        status: DeadLetterStatus::Pending,
                    },
                };
                tx.put(&key, encode_entry(&entry)?).await.map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = staged {
            tx.rollback().await.ok();
            return Err(e);
        }
        tx.commit().await?;

        metrics::counter!("dead_letter.recorded", "projection" => projection.to_string())
            .increment(1);
        tracing::error!(
            projection,
            aggregate_id = %envelope.aggregate_id,
            sequence = %envelope.sequence,
            attempts,
            error,
            "Event dead-lettered"
        );
        Ok(())
    }

    /// Pending entries of one projection, in key order, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] on storage failure or a corrupt entry.
    pub async fn list_pending(
        &self,
        projection: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let prefix = keys::dead_letter_prefix(projection);
        let mut pending = Vec::new();
        let mut last_key: Option<String> = None;

        loop {
            let page =
                store::scan_one(self.store.as_ref(), &prefix, last_key.as_deref(), SCAN_PAGE)
                    .await?;
            let page_len = page.len();
            for (key, bytes) in page {
                if last_key.as_deref() == Some(&key) {
                    continue;
                }
                let entry = decode_entry(&bytes)?;
                if entry.status == DeadLetterStatus::Pending {
                    pending.push(entry);
                    if pending.len() == limit {
                        return Ok(pending);
                    }
                }
                last_key = Some(key);
            }
            if page_len < SCAN_PAGE {
                return Ok(pending);
            }
        }
    }

    /// Number of pending entries of one projection.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] on storage failure or a corrupt entry.
    pub async fn count_pending(&self, projection: &str) -> Result<usize, DeadLetterError> {
        Ok(self.list_pending(projection, usize::MAX).await?.len())
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if the entry does not exist.
    pub async fn mark_resolved(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: SequenceNumber,
    ) -> Result<(), DeadLetterError> {
        self.set_status(projection, aggregate_id, sequence, DeadLetterStatus::Resolved)
            .await?;
        metrics::counter!("dead_letter.resolved", "projection" => projection.to_string())
            .increment(1);
        Ok(())
    }

    /// Mark an entry discarded: the event is given up on permanently.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if the entry does not exist.
    pub async fn mark_discarded(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: SequenceNumber,
    ) -> Result<(), DeadLetterError> {
        self.set_status(
            projection,
            aggregate_id,
            sequence,
            DeadLetterStatus::Discarded,
        )
        .await?;
        metrics::counter!("dead_letter.discarded", "projection" => projection.to_string())
            .increment(1);
        Ok(())
    }

    /// Republish a dead-lettered event to the bus and mark it resolved.
    ///
    /// The engine will reprocess the event through the normal path; call
    /// this after the underlying blocker (a missing earlier event, a fixed
    /// transform) has been addressed. Publication is retried with backoff,
    /// so a momentarily saturated bus does not fail the requeue.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if the entry does not exist,
    /// or [`DeadLetterError::Publish`] if the bus keeps refusing.
    pub async fn requeue(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: SequenceNumber,
        bus: &dyn EventBus,
        policy: &RetryPolicy,
    ) -> Result<(), DeadLetterError> {
        let key = keys::dead_letter(projection, aggregate_id, sequence);
        let entry = match store::get_one(self.store.as_ref(), &key).await? {
            Some(bytes) => decode_entry(&bytes)?,
            None => {
                return Err(DeadLetterError::NotFound {
                    projection: projection.to_string(),
                    aggregate_id: aggregate_id.clone(),
                    sequence,
                });
            }
        };

        retry_with_backoff(policy, || bus.publish(entry.envelope.clone())).await?;
        tracing::info!(
            projection,
            aggregate_id = %aggregate_id,
            sequence = %sequence,
            "Dead-lettered event requeued"
        );
        self.mark_resolved(projection, aggregate_id, sequence).await
    }

    async fn set_status(
        &self,
        projection: &str,
        aggregate_id: &AggregateId,
        sequence: SequenceNumber,
        status: DeadLetterStatus,
    ) -> Result<(), DeadLetterError> {
        let key = keys::dead_letter(projection, aggregate_id, sequence);

        let mut tx = self.store.begin().await?;
        let staged = match tx.get(&key).await {
            Ok(Some(bytes)) => match decode_entry(&bytes) {
                Ok(mut entry) => {
                    entry.status = status;
                    match encode_entry(&entry) {
                        Ok(encoded) => tx.put(&key, encoded).await.map_err(Into::into),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
            Ok(None) => Err(DeadLetterError::NotFound {
                projection: projection.to_string(),
                aggregate_id: aggregate_id.clone(),
                sequence,
            }),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = staged {
            tx.rollback().await.ok();
            return Err(e);
        }
        tx.commit().await?;
        Ok(())
    }
}

const SCAN_PAGE: usize = 256;

fn encode_entry(entry: &DeadLetterEntry) -> Result<Vec<u8>, DeadLetterError> {
    serde_json::to_vec(entry).map_err(|e| DeadLetterError::Decode(e.to_string()))
}

fn decode_entry(bytes: &[u8]) -> Result<DeadLetterEntry, DeadLetterError> {
    serde_json::from_slice(bytes).map_err(|e| DeadLetterError::Decode(e.to_string()))
}
