//! The command handler: validate, decide, and commit aggregate plus outbox
//! row in one transaction.
//!
//! # Atomicity
//!
//! A successful submission durably records exactly two things, together or
//! not at all: the new aggregate record and the outbox row carrying the
//! domain event. Publication to the event bus happens later, from the
//! outbox dispatcher — storage durability is never coupled to bus
//! availability.
//!
//! # Concurrency
//!
//! Submissions for different aggregates run concurrently without
//! coordination. Submissions for the same aggregate serialize through
//! optimistic versioning: the caller passes the version it last observed,
//! and a mismatch fails with [`CommandError::Conflict`] instead of losing
//! an update. Cancelling a submission before commit rolls the transaction
//! back, so no event can exist without its aggregate write.

use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use dualis_core::aggregate::{Aggregate, AggregateId, AggregateRecord, Rejection, Version};
use dualis_core::clock::Clock;
use dualis_core::event::{EventEnvelope, SequenceNumber};
use dualis_core::keys;
use dualis_core::store::{StoreError, Transaction, TransactionalStore};

use crate::outbox::OutboxEntry;

/// Errors reported to command submitters.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command violated a business rule. No state change, no event.
    #[error(transparent)]
    Validation(#[from] Rejection),

    /// Optimistic concurrency mismatch: another writer committed first.
    /// The caller may reload and retry with the fresh version.
    #[error("Conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    Conflict {
        /// The aggregate that was concurrently modified.
        aggregate_id: AggregateId,
        /// The version the caller expected.
        expected: Version,
        /// The actual committed version.
        actual: Version,
    },

    /// The command store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Stored bytes or event payloads could not be (de)serialized.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// What a successful submission returns to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// The aggregate that was created or modified.
    pub aggregate_id: AggregateId,
    /// Its new committed version.
    pub version: Version,
    /// The sequence number of the emitted event.
    pub sequence: SequenceNumber,
    /// The identifier of the emitted event.
    pub event_id: Uuid,
}

/// Validates and applies commands for one aggregate type.
///
/// # Example
///
/// ```ignore
/// let handler = CommandHandler::<Order>::new(store, Arc::new(SystemClock));
///
/// let receipt = handler
///     .submit(
///         AggregateId::new("order-1"),
///         Some(Version::INITIAL),
///         OrderCommand::Create { product: "widget".into(), quantity: 2, price_cents: 999 },
///     )
///     .await?;
/// assert_eq!(receipt.version, Version::new(1));
/// ```
pub struct CommandHandler<A: Aggregate> {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> CommandHandler<A> {
    /// Create a handler over the given command store.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            _aggregate: PhantomData,
        }
    }

    /// Submit a command.
    ///
    /// `expected_version` is the version the caller last observed:
    /// [`Version::INITIAL`] when creating, the loaded version when
    /// updating. `None` skips the check (last-writer-wins; transactions
    /// still serialize the write itself).
    ///
    /// # Errors
    ///
    /// - [`CommandError::Validation`]: business rule violated
    /// - [`CommandError::Conflict`]: stale `expected_version`
    /// - [`CommandError::Storage`]: the store failed or timed out
    pub async fn submit(
        &self,
        aggregate_id: AggregateId,
        expected_version: Option<Version>,
        command: A::Command,
    ) -> Result<Receipt, CommandError> {
        let mut tx = self.store.begin().await?;

        let decided = self
            .decide(tx.as_mut(), &aggregate_id, expected_version, command)
            .await;

        match decided {
            Ok(receipt) => {
                tx.commit().await?;
                tracing::info!(
                    aggregate_id = %receipt.aggregate_id,
                    aggregate_type = A::aggregate_type(),
                    version = %receipt.version,
                    sequence = %receipt.sequence,
                    "Command committed"
                );
                metrics::counter!(
                    "command.committed",
                    "aggregate_type" => A::aggregate_type()
                )
                .increment(1);
                Ok(receipt)
            }
            Err(e) => {
                tx.rollback().await.ok();
                metrics::counter!(
                    "command.rejected",
                    "aggregate_type" => A::aggregate_type()
                )
                .increment(1);
                Err(e)
            }
        }
    }

    /// Load current state, check the version, run the decision, and stage
    /// the aggregate record plus outbox row.
    async fn decide(
        &self,
        tx: &mut dyn Transaction,
        aggregate_id: &AggregateId,
        expected_version: Option<Version>,
        command: A::Command,
    ) -> Result<Receipt, CommandError> {
        let key = keys::aggregate(A::aggregate_type(), aggregate_id);

        let (state, actual) = match tx.get(&key).await? {
            Some(bytes) => {
                let record: AggregateRecord =
                    bincode::deserialize(&bytes).map_err(|e| CommandError::Encoding(e.to_string()))?;
                let state = record.decode::<A>().map_err(CommandError::Encoding)?;
                (Some(state), record.version)
            }
            None => (None, Version::INITIAL),
        };

        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(CommandError::Conflict {
                    aggregate_id: aggregate_id.clone(),
                    expected,
                    actual,
                });
            }
        }

        let (next_state, event) = A::handle(state.as_ref(), command)?;

        let version = actual.next();
        let sequence = SequenceNumber::new(version.value());
        let envelope = EventEnvelope::wrap(
            &event,
            aggregate_id.clone(),
            A::aggregate_type(),
            sequence,
            self.clock.now(),
        )
        .map_err(|e| CommandError::Encoding(e.to_string()))?;
        let event_id = envelope.event_id;

        let record =
            AggregateRecord::encode(&next_state, version).map_err(CommandError::Encoding)?;
        let record_bytes =
            bincode::serialize(&record).map_err(|e| CommandError::Encoding(e.to_string()))?;
        tx.put(&key, record_bytes).await?;

        let offset = OutboxEntry::allocate_offset(tx).await?;
        let entry = OutboxEntry::new(offset, envelope);
        let entry_bytes =
            bincode::serialize(&entry).map_err(|e| CommandError::Encoding(e.to_string()))?;
        tx.put(&keys::outbox(offset), entry_bytes).await?;

        Ok(Receipt {
            aggregate_id: aggregate_id.clone(),
            version,
            sequence,
            event_id,
        })
    }
}
