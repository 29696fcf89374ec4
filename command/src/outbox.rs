//! The transactional outbox and its dispatcher.
//!
//! The outbox is a durable staging area inside the command store: the
//! command handler appends one row per event in the same transaction as
//! the aggregate write, and the dispatcher later publishes those rows to
//! the event bus. A crash between commit and publish loses nothing — the
//! row is still there, before the cursor, and is redispatched on the next
//! poll. Redispatch after a crash means the same event may be published
//! twice; downstream checkpoints absorb the duplicate.
//!
//! Rows are assigned a global monotonic offset and retained after
//! dispatch; only the cursor (`outbox-cursor`) advances. The retained rows
//! double as the audit trail of every event the system ever emitted.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use dualis_core::bus::{DeliveryError, EventBus};
use dualis_core::event::EventEnvelope;
use dualis_core::keys;
use dualis_core::store::{self, StoreError, Transaction, TransactionalStore};

/// Default dispatcher poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default number of rows fetched per poll.
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Errors from outbox bookkeeping.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The command store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// A stored row or counter could not be decoded.
    #[error("Corrupt outbox data: {0}")]
    Encoding(String),
}

impl From<OutboxError> for crate::handler::CommandError {
    fn from(e: OutboxError) -> Self {
        match e {
            OutboxError::Storage(inner) => Self::Storage(inner),
            OutboxError::Encoding(message) => Self::Encoding(message),
        }
    }
}

/// One durably staged event awaiting (or past) dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Global monotonic position of this row.
    pub offset: u64,
    /// The event to publish.
    pub envelope: EventEnvelope,
}

impl OutboxEntry {
    /// Create an entry at the given offset.
    #[must_use]
    pub const fn new(offset: u64, envelope: EventEnvelope) -> Self {
        Self { offset, envelope }
    }

    /// Allocate the next global offset inside an open transaction.
    ///
    /// The counter lives in the store itself, so the allocation commits or
    /// rolls back together with the row using it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage failure or a corrupt counter.
    pub async fn allocate_offset(tx: &mut dyn Transaction) -> Result<u64, OutboxError> {
        let offset = match tx.get(keys::OUTBOX_NEXT_OFFSET_KEY).await? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 1,
        };
        tx.put(keys::OUTBOX_NEXT_OFFSET_KEY, encode_u64(offset + 1))
            .await?;
        Ok(offset)
    }
}

fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn decode_u64(bytes: &[u8]) -> Result<u64, OutboxError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| OutboxError::Encoding(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

/// Publishes outbox rows to the event bus, in offset order, exactly as far
/// as the bus accepts them.
///
/// # Lifecycle
///
/// - **Startup**: resumes from the persisted cursor; rows published before
///   a crash but not yet marked are republished (at-least-once).
/// - **Steady state**: polls for rows beyond the cursor, publishes each,
///   and advances the cursor transactionally after each accepted publish.
/// - **Shutdown**: a `watch` signal stops the loop after a final drain, so
///   nothing accepted by the bus is left unmarked.
///
/// # Example
///
/// ```ignore
/// let (mut dispatcher, shutdown) = OutboxDispatcher::new(store, bus);
/// let task = tokio::spawn(async move { dispatcher.run().await });
///
/// // ... later ...
/// shutdown.send(true).ok();
/// task.await??;
/// ```
pub struct OutboxDispatcher {
    store: Arc<dyn TransactionalStore>,
    bus: Arc<dyn EventBus>,
    poll_interval: Duration,
    batch_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl OutboxDispatcher {
    /// Create a dispatcher over the command store and the bus.
    ///
    /// Returns the dispatcher and a shutdown sender; send `true` to stop
    /// it gracefully.
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        bus: Arc<dyn EventBus>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Self {
            store,
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown: shutdown_rx,
        };
        (dispatcher, shutdown_tx)
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of rows fetched per poll.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run the dispatch loop until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] only on storage failure or corrupt rows; a
    /// refusing bus is not an error, the affected rows simply wait for the
    /// next poll.
    pub async fn run(&mut self) -> Result<(), OutboxError> {
        let cursor = self.load_cursor().await?;
        tracing::info!(cursor, "Outbox dispatcher started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut shutdown_open = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_once().await?;
                }
                changed = self.shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *self.shutdown.borrow() => {
                            // Flush whatever is pending before exiting.
                            self.drain_once().await?;
                            tracing::info!("Outbox dispatcher stopped");
                            return Ok(());
                        }
                        Ok(()) => {}
                        // Sender dropped without signalling; keep polling.
                        Err(_) => shutdown_open = false,
                    }
                }
            }
        }
    }

    /// Dispatch all currently pending rows; returns how many were
    /// published and marked.
    ///
    /// Stops early when the bus refuses an event (saturation, no
    /// subscribers yet); the refused row stays beyond the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage failure or a corrupt row.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        let mut dispatched = 0;

        loop {
            let cursor = self.load_cursor().await?;
            let from = keys::outbox(cursor + 1);
            let rows = store::scan_one(
                self.store.as_ref(),
                keys::OUTBOX_PREFIX,
                Some(&from),
                self.batch_size,
            )
            .await?;

            if rows.is_empty() {
                return Ok(dispatched);
            }

            for (key, bytes) in rows {
                let entry: OutboxEntry = bincode::deserialize(&bytes)
                    .map_err(|e| OutboxError::Encoding(format!("row {key}: {e}")))?;

                match self.bus.publish(entry.envelope.clone()).await {
                    Ok(()) => {
                        self.store_cursor(entry.offset).await?;
                        dispatched += 1;
                        metrics::counter!("outbox.dispatched").increment(1);
                        tracing::debug!(
                            offset = entry.offset,
                            event_type = %entry.envelope.event_type,
                            aggregate_id = %entry.envelope.aggregate_id,
                            "Outbox row dispatched"
                        );
                    }
                    Err(e @ (DeliveryError::Saturated { .. } | DeliveryError::NoSubscribers)) => {
                        tracing::debug!(
                            offset = entry.offset,
                            error = %e,
                            "Bus refused event, will retry on next poll"
                        );
                        return Ok(dispatched);
                    }
                    Err(e) => {
                        tracing::warn!(
                            offset = entry.offset,
                            error = %e,
                            "Publish failed, row stays in outbox"
                        );
                        return Ok(dispatched);
                    }
                }
            }
        }
    }

    /// Offset of the last row published before this dispatcher started.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] on storage failure or a corrupt cursor.
    pub async fn load_cursor(&self) -> Result<u64, OutboxError> {
        match store::get_one(self.store.as_ref(), keys::OUTBOX_CURSOR_KEY).await? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    async fn store_cursor(&self, offset: u64) -> Result<(), OutboxError> {
        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.put(keys::OUTBOX_CURSOR_KEY, encode_u64(offset)).await {
            tx.rollback().await.ok();
            return Err(e.into());
        }
        tx.commit().await?;
        Ok(())
    }
}
