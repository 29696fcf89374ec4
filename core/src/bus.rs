//! Event bus abstraction carrying domain events from the command side to
//! the projection side.
//!
//! # Delivery Guarantees
//!
//! - **At-least-once per subscriber**: a published event is redelivered
//!   until the subscriber acknowledges it. Duplicate delivery is an
//!   expected, designed-for condition, not an error.
//! - **Per-aggregate ordering**: events sharing an [`AggregateId`] reach a
//!   single subscriber in non-decreasing sequence order; events for
//!   different aggregates may interleave arbitrarily.
//! - **Explicit acknowledgment**: `ack` removes a delivery permanently,
//!   `nack` requeues it for redelivery with an incremented attempt count.
//!
//! # Implementations
//!
//! - `InProcessEventBus` (in `dualis-bus`): the production single-process
//!   implementation.
//!
//! The trait is the seam where an out-of-process broker would plug in; the
//! envelope plus ack/nack is exactly the message contract such a broker
//! needs.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::aggregate::AggregateId;
use crate::event::EventEnvelope;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    /// The subscriber's queue is full; the publish was refused.
    ///
    /// The event stays in the outbox and is redispatched later — never
    /// lost.
    #[error("Subscriber '{subscriber}' is saturated ({capacity} events queued)")]
    Saturated {
        /// The subscriber whose queue is full.
        subscriber: String,
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The bus has been shut down.
    #[error("Event bus is closed")]
    Closed,

    /// No subscriber is registered; the event would be lost if accepted.
    ///
    /// An in-process bus has no durable log, so publishing into the void is
    /// refused. The outbox keeps the event and the dispatcher retries once
    /// subscriptions exist.
    #[error("No subscribers registered")]
    NoSubscribers,

    /// An ack/nack referenced a delivery the bus does not know about.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Opaque handle identifying one in-flight delivery to one subscriber.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivery of an event to a subscriber.
///
/// The same envelope may be delivered multiple times; `attempt` counts the
/// deliveries (starting at 1) so consumers can drive backoff and
/// dead-letter decisions from it.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The event being delivered.
    pub envelope: EventEnvelope,
    /// How many times this event has been delivered to this subscriber,
    /// including this delivery.
    pub attempt: u32,
    /// Handle for ack/nack.
    pub tag: DeliveryTag,
}

impl Delivery {
    /// The aggregate this delivery belongs to.
    #[must_use]
    pub const fn aggregate_id(&self) -> &AggregateId {
        &self.envelope.aggregate_id
    }
}

/// Boxed future alias used by the bus traits.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeliveryError>> + Send + 'a>>;

/// A subscriber's view of the event stream.
///
/// All methods take `&self`; implementations synchronize internally so a
/// consumer task can pull deliveries while worker tasks ack and nack
/// concurrently.
pub trait Subscription: Send + Sync {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the bus is closed and every queued event has
    /// been delivered and acknowledged or abandoned.
    fn next(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>>;

    /// Acknowledge a delivery: the event is done and will not be
    /// redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownDelivery`] if the tag is not
    /// in flight.
    fn ack(&self, tag: DeliveryTag) -> BusFuture<'_, ()>;

    /// Reject a delivery: the event is requeued at the front of its
    /// aggregate's queue and will be redelivered with an incremented
    /// attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownDelivery`] if the tag is not
    /// in flight.
    fn nack(&self, tag: DeliveryTag) -> BusFuture<'_, ()>;
}

/// Trait for event bus implementations.
pub trait EventBus: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Publication is all-or-nothing across subscribers: if any subscriber
    /// is saturated the publish fails and the caller (the outbox
    /// dispatcher) retries later.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Saturated`] or [`DeliveryError::Closed`].
    fn publish(&self, envelope: EventEnvelope) -> BusFuture<'_, ()>;

    /// Register a named subscriber and return its subscription.
    ///
    /// Each subscriber receives its own copy of every event published
    /// after the subscription is created.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Closed`] if the bus has been shut down.
    fn subscribe(&self, name: &str) -> BusFuture<'_, std::sync::Arc<dyn Subscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_error_display() {
        let error = DeliveryError::Saturated {
            subscriber: "order-summary".to_string(),
            capacity: 1024,
        };
        let display = format!("{error}");
        assert!(display.contains("order-summary"));
        assert!(display.contains("1024"));
    }

    #[test]
    fn delivery_tag_display() {
        assert_eq!(format!("{}", DeliveryTag(7)), "7");
    }
}
