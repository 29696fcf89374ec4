//! The in-process event bus implementation.
//!
//! Delivery model, per subscriber:
//!
//! - every aggregate has its own FIFO queue of undelivered events
//! - at most one delivery per aggregate is in flight at a time; the next
//!   event for an aggregate is only handed out after the previous one was
//!   acked or nacked, which preserves per-aggregate order across
//!   redeliveries
//! - an event stays at the front of its queue until acked; nack leaves it
//!   there with an incremented attempt count, so redelivery is guaranteed
//! - queues are bounded; a full subscriber refuses the publish and the
//!   outbox dispatcher retries later
//!
//! Publication is fan-out: each subscriber gets its own copy. If one
//! subscriber is saturated mid-fan-out, other subscribers may already have
//! received the event; the dispatcher's retry then redelivers to everyone,
//! and checkpointed consumers discard the duplicate. That is the designed
//! at-least-once behavior, not a fault.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use dualis_core::aggregate::AggregateId;
use dualis_core::bus::{BusFuture, Delivery, DeliveryError, DeliveryTag, EventBus, Subscription};
use dualis_core::event::EventEnvelope;

/// Default per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

struct QueuedEvent {
    envelope: EventEnvelope,
    attempts: u32,
}

#[derive(Default)]
struct SubscriberState {
    /// Per-aggregate FIFO of undelivered events. The front element may be
    /// in flight; it is only popped on ack.
    queues: HashMap<AggregateId, VecDeque<QueuedEvent>>,
    /// Aggregates with a deliverable head event, in arrival order.
    ready: VecDeque<AggregateId>,
    ready_set: HashSet<AggregateId>,
    /// Aggregates with an in-flight delivery.
    blocked: HashSet<AggregateId>,
    /// Tag of each in-flight delivery, mapped back to its aggregate.
    in_flight: HashMap<u64, AggregateId>,
    next_tag: u64,
    /// Total queued events, including the in-flight fronts.
    depth: usize,
    closed: bool,
}

impl SubscriberState {
    fn mark_ready(&mut self, aggregate_id: &AggregateId) {
        if self.blocked.contains(aggregate_id) || self.ready_set.contains(aggregate_id) {
            return;
        }
        if self
            .queues
            .get(aggregate_id)
            .is_some_and(|q| !q.is_empty())
        {
            self.ready.push_back(aggregate_id.clone());
            self.ready_set.insert(aggregate_id.clone());
        }
    }
}

struct SubscriberShared {
    name: String,
    capacity: usize,
    state: Mutex<SubscriberState>,
    notify: Notify,
}

impl SubscriberShared {
    fn lock(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, envelope: EventEnvelope) -> Result<(), DeliveryError> {
        let mut state = self.lock();
        if state.closed {
            return Err(DeliveryError::Closed);
        }
        if state.depth >= self.capacity {
            metrics::counter!("bus.publish.saturated", "subscriber" => self.name.clone())
                .increment(1);
            return Err(DeliveryError::Saturated {
                subscriber: self.name.clone(),
                capacity: self.capacity,
            });
        }

        let aggregate_id = envelope.aggregate_id.clone();
        state
            .queues
            .entry(aggregate_id.clone())
            .or_default()
            .push_back(QueuedEvent {
                envelope,
                attempts: 0,
            });
        state.depth += 1;
        state.mark_ready(&aggregate_id);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }
}

/// A subscriber's handle onto the in-process bus.
pub struct InProcessSubscription {
    shared: Arc<SubscriberShared>,
}

impl InProcessSubscription {
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(aggregate_id) = state.ready.pop_front() {
                    state.ready_set.remove(&aggregate_id);

                    // The queue for a ready aggregate is never empty.
                    let (attempt, envelope) = match state.queues.get_mut(&aggregate_id) {
                        Some(queue) => match queue.front_mut() {
                            Some(event) => {
                                event.attempts += 1;
                                (event.attempts, event.envelope.clone())
                            }
                            None => continue,
                        },
                        None => continue,
                    };

                    let tag = state.next_tag;
                    state.next_tag += 1;
                    state.in_flight.insert(tag, aggregate_id.clone());
                    state.blocked.insert(aggregate_id);

                    if attempt > 1 {
                        metrics::counter!("bus.redelivery", "subscriber" => self.shared.name.clone())
                            .increment(1);
                    }

                    return Some(Delivery {
                        envelope,
                        attempt,
                        tag: DeliveryTag(tag),
                    });
                }

                if state.closed && state.depth == 0 {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn settle(&self, tag: DeliveryTag, acked: bool) -> Result<(), DeliveryError> {
        let mut state = self.shared.lock();
        let Some(aggregate_id) = state.in_flight.remove(&tag.0) else {
            return Err(DeliveryError::UnknownDelivery(tag.0));
        };
        state.blocked.remove(&aggregate_id);

        if acked {
            let mut popped = false;
            let mut emptied = false;
            if let Some(queue) = state.queues.get_mut(&aggregate_id) {
                popped = queue.pop_front().is_some();
                emptied = queue.is_empty();
            }
            if popped {
                state.depth -= 1;
            }
            if emptied {
                state.queues.remove(&aggregate_id);
            }
        }
        state.mark_ready(&aggregate_id);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl Subscription for InProcessSubscription {
    fn next(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(self.next_delivery())
    }

    fn ack(&self, tag: DeliveryTag) -> BusFuture<'_, ()> {
        Box::pin(async move { self.settle(tag, true) })
    }

    fn nack(&self, tag: DeliveryTag) -> BusFuture<'_, ()> {
        Box::pin(async move { self.settle(tag, false) })
    }
}

/// In-process event bus with at-least-once delivery and per-aggregate
/// ordering.
///
/// # Lifecycle
///
/// Subscriptions must be registered before the outbox dispatcher starts
/// publishing: the bus has no durable log, so it refuses publishes while no
/// subscriber exists ([`DeliveryError::NoSubscribers`]) rather than
/// dropping events. [`InProcessEventBus::shutdown`] closes the bus; pending
/// deliveries are still handed out, then `next()` returns `None`.
///
/// # Example
///
/// ```ignore
/// let bus = Arc::new(InProcessEventBus::new(1024));
/// let subscription = bus.subscribe("order-summary").await?;
///
/// bus.publish(envelope).await?;
///
/// let delivery = subscription.next().await.unwrap();
/// // ... apply ...
/// subscription.ack(delivery.tag).await?;
/// ```
pub struct InProcessEventBus {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    capacity: usize,
    closed: Mutex<bool>,
}

impl InProcessEventBus {
    /// Create a bus with the given per-subscriber queue capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
            closed: Mutex::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriber_list(&self) -> Vec<Arc<SubscriberShared>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close the bus: publishes are refused, and every subscription's
    /// `next()` returns `None` once its queues drain.
    pub fn shutdown(&self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        for subscriber in self.subscriber_list() {
            subscriber.lock().closed = true;
            subscriber.notify.notify_waiters();
        }
        tracing::info!("Event bus shut down");
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus for InProcessEventBus {
    fn publish(&self, envelope: EventEnvelope) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(DeliveryError::Closed);
            }
            let subscribers = self.subscriber_list();
            if subscribers.is_empty() {
                return Err(DeliveryError::NoSubscribers);
            }

            let mut result = Ok(());
            for subscriber in &subscribers {
                if let Err(e) = subscriber.enqueue(envelope.clone()) {
                    tracing::warn!(
                        subscriber = %subscriber.name,
                        event_type = %envelope.event_type,
                        error = %e,
                        "Publish refused by subscriber"
                    );
                    result = Err(e);
                }
            }

            if result.is_ok() {
                metrics::counter!("bus.published").increment(1);
                tracing::debug!(
                    event_type = %envelope.event_type,
                    aggregate_id = %envelope.aggregate_id,
                    sequence = %envelope.sequence,
                    subscribers = subscribers.len(),
                    "Event published"
                );
            }
            result
        })
    }

    fn subscribe(&self, name: &str) -> BusFuture<'_, Arc<dyn Subscription>> {
        let name = name.to_string();
        Box::pin(async move {
            if self.is_closed() {
                return Err(DeliveryError::Closed);
            }
            let shared = Arc::new(SubscriberShared {
                name: name.clone(),
                capacity: self.capacity,
                state: Mutex::new(SubscriberState::default()),
                notify: Notify::new(),
            });
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&shared));
            tracing::info!(subscriber = %name, "Subscriber registered");
            Ok(Arc::new(InProcessSubscription { shared }) as Arc<dyn Subscription>)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Utc;
    use dualis_core::event::SequenceNumber;
    use uuid::Uuid;

    fn envelope(aggregate: &str, seq: u64) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_id: AggregateId::new(aggregate),
            aggregate_type: "test".to_string(),
            sequence: SequenceNumber::new(seq),
            event_type: "TestEvent.v1".to_string(),
            payload: vec![1, 2, 3],
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_refused() {
        let bus = InProcessEventBus::default();
        let result = bus.publish(envelope("a", 1)).await;
        assert!(matches!(result, Err(DeliveryError::NoSubscribers)));
    }

    #[tokio::test]
    async fn delivers_in_publish_order_per_aggregate() {
        let bus = InProcessEventBus::default();
        let sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();
        bus.publish(envelope("a", 2)).await.unwrap();

        let d1 = sub.next().await.unwrap();
        assert_eq!(d1.envelope.sequence, SequenceNumber::new(1));
        sub.ack(d1.tag).await.unwrap();

        let d2 = sub.next().await.unwrap();
        assert_eq!(d2.envelope.sequence, SequenceNumber::new(2));
        sub.ack(d2.tag).await.unwrap();
    }

    #[tokio::test]
    async fn same_aggregate_blocks_until_settled() {
        let bus = InProcessEventBus::default();
        let sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();
        bus.publish(envelope("a", 2)).await.unwrap();
        bus.publish(envelope("b", 1)).await.unwrap();

        let d1 = sub.next().await.unwrap();
        assert_eq!(d1.aggregate_id(), &AggregateId::new("a"));

        // seq 2 of "a" must not be handed out while seq 1 is in flight,
        // but "b" is independent and flows.
        let d2 = sub.next().await.unwrap();
        assert_eq!(d2.aggregate_id(), &AggregateId::new("b"));

        sub.ack(d1.tag).await.unwrap();
        let d3 = sub.next().await.unwrap();
        assert_eq!(d3.aggregate_id(), &AggregateId::new("a"));
        assert_eq!(d3.envelope.sequence, SequenceNumber::new(2));
    }

    #[tokio::test]
    async fn nack_redelivers_same_event_with_higher_attempt() {
        let bus = InProcessEventBus::default();
        let sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();

        let d1 = sub.next().await.unwrap();
        assert_eq!(d1.attempt, 1);
        sub.nack(d1.tag).await.unwrap();

        let d2 = sub.next().await.unwrap();
        assert_eq!(d2.envelope.event_id, d1.envelope.event_id);
        assert_eq!(d2.attempt, 2);
        sub.ack(d2.tag).await.unwrap();
    }

    #[tokio::test]
    async fn ack_of_last_event_resets_the_aggregate_queue() {
        let bus = InProcessEventBus::new(2);
        let sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();
        let d1 = sub.next().await.unwrap();
        sub.ack(d1.tag).await.unwrap();

        // Depth accounting and queue removal both reset on that ack; the
        // aggregate can fill the bounded queue again.
        bus.publish(envelope("a", 2)).await.unwrap();
        bus.publish(envelope("a", 3)).await.unwrap();

        let d2 = sub.next().await.unwrap();
        assert_eq!(d2.envelope.sequence, SequenceNumber::new(2));
        sub.ack(d2.tag).await.unwrap();
        let d3 = sub.next().await.unwrap();
        assert_eq!(d3.envelope.sequence, SequenceNumber::new(3));
        sub.ack(d3.tag).await.unwrap();
    }

    #[tokio::test]
    async fn ack_of_unknown_tag_fails() {
        let bus = InProcessEventBus::default();
        let sub = bus.subscribe("test").await.unwrap();
        let result = sub.ack(DeliveryTag(99)).await;
        assert!(matches!(result, Err(DeliveryError::UnknownDelivery(99))));
    }

    #[tokio::test]
    async fn saturation_refuses_publish() {
        let bus = InProcessEventBus::new(2);
        let _sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();
        bus.publish(envelope("a", 2)).await.unwrap();
        let result = bus.publish(envelope("a", 3)).await;
        assert!(matches!(result, Err(DeliveryError::Saturated { .. })));
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_copy() {
        let bus = InProcessEventBus::default();
        let sub1 = bus.subscribe("one").await.unwrap();
        let sub2 = bus.subscribe("two").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();

        let d1 = sub1.next().await.unwrap();
        let d2 = sub2.next().await.unwrap();
        assert_eq!(d1.envelope.event_id, d2.envelope.event_id);
        sub1.ack(d1.tag).await.unwrap();
        sub2.ack(d2.tag).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_then_ends_stream() {
        let bus = InProcessEventBus::default();
        let sub = bus.subscribe("test").await.unwrap();

        bus.publish(envelope("a", 1)).await.unwrap();
        bus.shutdown();

        // Pending event is still delivered after shutdown.
        let d = sub.next().await.unwrap();
        sub.ack(d.tag).await.unwrap();

        assert!(sub.next().await.is_none());
        assert!(matches!(
            bus.publish(envelope("a", 2)).await,
            Err(DeliveryError::Closed)
        ));
    }
}
