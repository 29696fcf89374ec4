//! The projection transform contract: from domain events to read models.
//!
//! A projection transform is the **pure** part of the query side: given the
//! current read model (if any) and a decoded event, it decides what the
//! read model should become. All store I/O — loading the model, checking
//! the checkpoint, committing the upsert — belongs to the projection
//! engine, which can then make the model write and the checkpoint advance
//! atomic.
//!
//! Event dispatch is a closed tagged variant: the transform matches on its
//! concrete event enum, so an unhandled event type is a compile-time hole
//! in a `match`, not a runtime lookup miss.
//!
//! # Example
//!
//! ```ignore
//! impl ProjectionTransform for OrderProjection {
//!     type Event = OrderEvent;
//!     type Model = OrderSummary;
//!
//!     fn name(&self) -> &'static str {
//!         "order-summary"
//!     }
//!
//!     fn apply(
//!         &self,
//!         current: Option<OrderSummary>,
//!         event: &OrderEvent,
//!         envelope: &EventEnvelope,
//!     ) -> Result<Applied<OrderSummary>, TransformError> {
//!         match event {
//!             OrderEvent::OrderCreated { product, quantity, price_cents } => {
//!                 Ok(Applied::Upsert(OrderSummary { /* ... */ }))
//!             }
//!             OrderEvent::OrderCancelled { .. } => {
//!                 // explicit choice: keep the row with a cancelled status,
//!                 // or return Applied::Delete to drop it
//!                 # unimplemented!()
//!             }
//!         }
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::event::{Event, EventEnvelope, SequenceNumber};

/// Error produced by a projection transform.
///
/// Transforms are pure, so the only failures are semantic: an event that
/// cannot be interpreted against the current model.
#[derive(Error, Debug, Clone)]
#[error("Transform '{transform}' failed on {event_type}: {message}")]
pub struct TransformError {
    /// Name of the failing transform.
    pub transform: &'static str,
    /// The event type that could not be applied.
    pub event_type: String,
    /// What went wrong.
    pub message: String,
}

impl TransformError {
    /// Create a new transform error.
    #[must_use]
    pub fn new(
        transform: &'static str,
        event_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            transform,
            event_type: event_type.into(),
            message: message.into(),
        }
    }
}

/// The outcome a transform decides for the read model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied<M> {
    /// Insert or overwrite the read model with this value.
    Upsert(M),
    /// Remove the read model row entirely (deletions/cancellations that
    /// should disappear from queries).
    Delete,
    /// The event is valid but changes nothing in this read model.
    Skip,
}

/// A pure mapping from domain events to a read model.
///
/// Implementations must be deterministic: applying the same events in the
/// same order always produces the same model. The engine guarantees each
/// event is applied at most once per model (checkpointed), so transforms
/// do not need internal deduplication.
pub trait ProjectionTransform: Send + Sync + 'static {
    /// The event type this transform consumes.
    type Event: Event + DeserializeOwned;

    /// The read model this transform maintains.
    type Model: Serialize + DeserializeOwned + Send + 'static;

    /// Unique name of this projection, used for checkpoint and read-model
    /// keys. Must be stable across restarts.
    fn name(&self) -> &'static str;

    /// Decide the new read model for an event.
    ///
    /// `current` is the model as of the previous applied event, or `None`
    /// if no event for this aggregate has been applied yet. `envelope`
    /// carries the identifiers and timestamp for transforms that project
    /// them into the model.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if the event cannot be interpreted; the
    /// engine treats this as a permanent failure and dead-letters the
    /// event after its retry budget.
    fn apply(
        &self,
        current: Option<Self::Model>,
        event: &Self::Event,
        envelope: &EventEnvelope,
    ) -> Result<Applied<Self::Model>, TransformError>;
}

/// Per-aggregate marker of the last successfully applied event.
///
/// Stored in the query store in the same transaction as the read-model
/// write, which makes duplicate detection and gap detection crash-safe: a
/// crash between "model written" and "checkpoint advanced" is impossible.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last applied sequence number.
    pub sequence: SequenceNumber,
    /// When the checkpoint was last advanced.
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint at the given sequence.
    #[must_use]
    pub const fn new(sequence: SequenceNumber, updated_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            updated_at,
        }
    }
}
