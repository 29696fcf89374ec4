//! Scriptable subscription for driving consumers without a real bus.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use dualis_core::bus::{BusFuture, Delivery, DeliveryError, DeliveryTag, Subscription};
use dualis_core::event::EventEnvelope;

#[derive(Clone)]
struct QueuedDelivery {
    envelope: EventEnvelope,
    attempt: u32,
}

#[derive(Default)]
struct StubState {
    queue: VecDeque<QueuedDelivery>,
    in_flight: HashMap<u64, QueuedDelivery>,
    next_tag: u64,
    nacks: u64,
}

/// A [`Subscription`] fed directly by the test instead of a bus.
///
/// Push envelopes in whatever order the scenario calls for, including
/// out-of-order and duplicated, then hand the subscription to the consumer
/// under test. Unlike the in-process bus, a nacked delivery goes to the
/// *back* of the queue, which lets later-pushed envelopes overtake it; this
/// models a broker that redelivers without ordering so gap recovery can be
/// exercised.
///
/// `next()` returns `None` once the queue is empty and nothing is in
/// flight, so a consumer loop drains the script and then terminates. Push
/// everything before the consumer starts.
#[derive(Default)]
pub struct StubSubscription {
    state: Mutex<StubState>,
    notify: Notify,
}

impl StubSubscription {
    /// Create an empty scripted subscription.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope to the delivery script.
    pub fn push(&self, envelope: EventEnvelope) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(QueuedDelivery {
            envelope,
            attempt: 0,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Envelopes not yet delivered (or redelivered after a nack).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .len()
    }

    /// How many deliveries have been nacked so far.
    #[must_use]
    pub fn nacks(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .nacks
    }

    fn settle(&self, tag: DeliveryTag, requeue: bool) -> Result<(), DeliveryError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(delivery) = state.in_flight.remove(&tag.0) else {
            return Err(DeliveryError::UnknownDelivery(tag.0));
        };
        if requeue {
            state.nacks += 1;
            state.queue.push_back(delivery);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl Subscription for StubSubscription {
    fn next(&self) -> Pin<Box<dyn Future<Output = Option<Delivery>> + Send + '_>> {
        Box::pin(async move {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(mut delivery) = state.queue.pop_front() {
                        delivery.attempt += 1;
                        let tag = state.next_tag;
                        state.next_tag += 1;
                        state.in_flight.insert(tag, delivery.clone());
                        return Some(Delivery {
                            envelope: delivery.envelope,
                            attempt: delivery.attempt,
                            tag: DeliveryTag(tag),
                        });
                    }
                    if state.in_flight.is_empty() {
                        return None;
                    }
                }

                notified.await;
            }
        })
    }

    fn ack(&self, tag: DeliveryTag) -> BusFuture<'_, ()> {
        let result = self.settle(tag, false);
        Box::pin(async move { result })
    }

    fn nack(&self, tag: DeliveryTag) -> BusFuture<'_, ()> {
        let result = self.settle(tag, true);
        Box::pin(async move { result })
    }
}
