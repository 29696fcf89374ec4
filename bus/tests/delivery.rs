//! Cross-task delivery behavior of the in-process bus.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use dualis_bus::InProcessEventBus;
use dualis_core::aggregate::AggregateId;
use dualis_core::bus::{DeliveryError, EventBus, Subscription};
use dualis_core::event::{EventEnvelope, SequenceNumber};

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
async fn blocked_consumer_wakes_on_publish() {
    let bus = Arc::new(InProcessEventBus::new(16));
    let subscription = bus.subscribe("test").await.unwrap();

    let consumer = tokio::spawn({
        let subscription = Arc::clone(&subscription);
        async move {
            let delivery = subscription.next().await.unwrap();
            subscription.ack(delivery.tag).await.unwrap();
            delivery.envelope.sequence
        }
    });

    // The consumer is parked on an empty queue until this publish.
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.publish(envelope("a", 1)).await.unwrap();

    let sequence = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer did not wake")
        .unwrap();
    assert_eq!(sequence, SequenceNumber::new(1));
}

#[tokio::test]
async fn workers_share_one_subscription() {
    let bus = Arc::new(InProcessEventBus::new(16));
    let subscription = bus.subscribe("test").await.unwrap();

    for aggregate in ["a", "b", "c", "d"] {
        bus.publish(envelope(aggregate, 1)).await.unwrap();
    }
    bus.shutdown();

    let mut workers = Vec::new();
    for _ in 0..2 {
        let subscription = Arc::clone(&subscription);
        workers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(delivery) = subscription.next().await {
                seen.push(delivery.aggregate_id().to_string());
                subscription.ack(delivery.tag).await.unwrap();
            }
            seen
        }));
    }

    let mut seen = Vec::new();
    for worker in workers {
        seen.extend(worker.await.unwrap());
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn ack_frees_capacity_for_the_next_publish() {
    let bus = InProcessEventBus::new(2);
    let subscription = bus.subscribe("test").await.unwrap();

    bus.publish(envelope("a", 1)).await.unwrap();
    bus.publish(envelope("a", 2)).await.unwrap();
    assert!(matches!(
        bus.publish(envelope("a", 3)).await,
        Err(DeliveryError::Saturated { .. })
    ));

    let delivery = subscription.next().await.unwrap();
    subscription.ack(delivery.tag).await.unwrap();

    bus.publish(envelope("a", 3)).await.unwrap();
}

#[tokio::test]
async fn nack_does_not_free_capacity() {
    let bus = InProcessEventBus::new(2);
    let subscription = bus.subscribe("test").await.unwrap();

    bus.publish(envelope("a", 1)).await.unwrap();
    bus.publish(envelope("a", 2)).await.unwrap();

    let delivery = subscription.next().await.unwrap();
    subscription.nack(delivery.tag).await.unwrap();

    // The nacked event is still queued, so the subscriber stays full.
    assert!(matches!(
        bus.publish(envelope("a", 3)).await,
        Err(DeliveryError::Saturated { .. })
    ));
}

#[tokio::test]
async fn shutdown_wakes_a_parked_consumer() {
    let bus = Arc::new(InProcessEventBus::new(16));
    let subscription = bus.subscribe("test").await.unwrap();

    let consumer = tokio::spawn({
        let subscription = Arc::clone(&subscription);
        async move { subscription.next().await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.shutdown();

    let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer did not observe shutdown")
        .unwrap();
    assert!(delivery.is_none());
}

#[tokio::test]
async fn late_subscriber_misses_earlier_events() {
    let bus = InProcessEventBus::new(16);
    let early = bus.subscribe("early").await.unwrap();

    bus.publish(envelope("a", 1)).await.unwrap();

    // Subscriptions only receive events published after they exist; the
    // outbox cursor, not the bus, is the source of replay.
    let late = bus.subscribe("late").await.unwrap();
    bus.publish(envelope("a", 2)).await.unwrap();
    bus.shutdown();

    let mut early_seqs = Vec::new();
    while let Some(delivery) = early.next().await {
        early_seqs.push(delivery.envelope.sequence);
        early.ack(delivery.tag).await.unwrap();
    }
    assert_eq!(
        early_seqs,
        vec![SequenceNumber::new(1), SequenceNumber::new(2)]
    );

    let delivery = late.next().await.unwrap();
    assert_eq!(delivery.envelope.sequence, SequenceNumber::new(2));
    late.ack(delivery.tag).await.unwrap();
    assert!(late.next().await.is_none());
}
