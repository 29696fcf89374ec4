//! Domain events and the delivery envelope.
//!
//! A domain event is an immutable fact describing a committed state change.
//! It is created exactly once by the command handler, inside the same
//! transaction as the aggregate write, and never mutated afterwards.
//!
//! # Serialization
//!
//! Event payloads are serialized with `bincode`: compact, fast, and uniform
//! across all-Rust services. The [`Event`] trait provides default
//! `to_bytes`/`from_bytes` implementations for any serde type.
//!
//! # Example
//!
//! ```
//! use dualis_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum OrderEvent {
//!     OrderCreated { product: String, quantity: u32 },
//!     OrderCancelled { reason: String },
//! }
//!
//! impl Event for OrderEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             OrderEvent::OrderCreated { .. } => "OrderCreated.v1",
//!             OrderEvent::OrderCancelled { .. } => "OrderCancelled.v1",
//!         }
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::aggregate::AggregateId;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize an event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize an event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Per-aggregate monotonic event counter.
///
/// The first event of an aggregate carries sequence 1; every subsequent
/// event increments by exactly 1. The projection side relies on this to
/// detect duplicates (`seq <= checkpoint`) and gaps (`seq > checkpoint + 1`).
///
/// # Examples
///
/// ```
/// use dualis_core::event::SequenceNumber;
///
/// let first = SequenceNumber::FIRST;
/// assert_eq!(first.value(), 1);
/// assert!(first.next().follows(first));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The sequence number of the first event of any aggregate.
    pub const FIRST: Self = Self(1);

    /// Create a sequence number with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the sequence value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next sequence number (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this sequence number immediately follows `other`.
    #[must_use]
    pub const fn follows(self, other: Self) -> bool {
        self.0 == other.0 + 1
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(sequence: SequenceNumber) -> Self {
        sequence.0
    }
}

/// A domain event emitted by an aggregate.
///
/// # Event Naming Convention
///
/// `event_type()` returns a stable identifier with a version suffix, which
/// allows payload schemas to evolve over time:
///
/// - `"OrderCreated.v1"`
/// - `"OrderCancelled.v1"`
/// - `"OrderShipped.v2"` (after a schema change)
pub trait Event: Send + Sync + 'static {
    /// Returns the stable, versioned event type identifier.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the event cannot be
    /// serialized (rare with bincode).
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] if the bytes are
    /// corrupted or belong to an incompatible schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// The envelope carrying a serialized domain event through the outbox and
/// the event bus.
///
/// The envelope is the wire contract between the command side and the
/// projection side: everything the projection engine needs to order,
/// deduplicate, and decode an event without touching the command store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,
    /// Stable aggregate type name (e.g. `"order"`).
    pub aggregate_type: String,
    /// Per-aggregate monotonic position of this event.
    pub sequence: SequenceNumber,
    /// Versioned event type identifier (e.g. `"OrderCreated.v1"`).
    pub event_type: String,
    /// Bincode-serialized event payload.
    pub payload: Vec<u8>,
    /// When the command handler recorded the event.
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap a domain event into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if the payload cannot be
    /// serialized.
    pub fn wrap<E: Event + Serialize>(
        event: &E,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence: SequenceNumber,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence,
            event_type: event.event_type().to_string(),
            payload: event.to_bytes()?,
            occurred_at,
        })
    }

    /// Decode the payload back into the concrete event type.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] on payload mismatch.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        E::from_bytes(&self.payload)
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seq={} aggregate={} ({} bytes)",
            self.event_type,
            self.sequence,
            self.aggregate_id,
            self.payload.len()
        )
    }
}
