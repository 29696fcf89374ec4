//! End-to-end order scenarios across the whole pipeline: command handler,
//! outbox dispatcher, in-process bus, projection engine, query handler.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use dualis_bus::InProcessEventBus;
use dualis_command::{CommandError, CommandHandler, OutboxDispatcher};
use dualis_core::aggregate::{AggregateId, Version};
use dualis_core::bus::EventBus;
use dualis_core::event::SequenceNumber;
use dualis_core::keys;
use dualis_core::store;
use dualis_projection::{ProjectionEngine, QueryError, QueryHandler};
use dualis_testing::{InMemoryStore, test_clock};

use orders_demo::{Order, OrderCommand, OrderProjection};

struct Pipeline {
    command_store: InMemoryStore,
    bus: Arc<InProcessEventBus>,
    dispatcher: OutboxDispatcher,
    engine_task: JoinHandle<()>,
    engine_shutdown: watch::Sender<bool>,
    orders: CommandHandler<Order>,
    queries: QueryHandler<OrderProjection>,
}

impl Pipeline {
    async fn start() -> Self {
        let command_store = InMemoryStore::new();
        let query_store = InMemoryStore::new();
        let clock = Arc::new(test_clock());
        let bus = Arc::new(InProcessEventBus::new(64));

        let subscription = bus.subscribe("order-summary").await.unwrap();
        let (engine, engine_shutdown) = ProjectionEngine::new(
            OrderProjection,
            Arc::new(query_store.clone()),
            clock.clone(),
        );
        let engine_task = tokio::spawn(engine.run(subscription));

        // drain_once is driven manually for determinism; the run() loop
        // and its shutdown sender are not used here.
        let (dispatcher, _dispatcher_shutdown) =
            OutboxDispatcher::new(Arc::new(command_store.clone()), bus.clone());

        let orders = CommandHandler::<Order>::new(Arc::new(command_store.clone()), clock);
        let queries = QueryHandler::new(Arc::new(query_store), Arc::new(OrderProjection));

        Self {
            command_store,
            bus,
            dispatcher,
            engine_task,
            engine_shutdown,
            orders,
            queries,
        }
    }

    /// Publish pending outbox rows and wait until the projection has
    /// applied up to `sequence` for the aggregate.
    async fn sync_to(&self, id: &AggregateId, sequence: SequenceNumber) {
        self.dispatcher.drain_once().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(checkpoint) = self.queries.checkpoint(id).await.unwrap() {
                    if checkpoint.sequence >= sequence {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("projection did not catch up in time");
    }

    async fn stop(self) {
        self.bus.shutdown();
        self.engine_shutdown.send(true).ok();
        self.engine_task.await.unwrap();
    }
}

#[tokio::test]
async fn create_order_end_to_end() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let receipt = pipeline
        .orders
        .submit(
            id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.version, Version::new(1));

    pipeline.sync_to(&id, receipt.sequence).await;

    let summary = pipeline.queries.get(&id).await.unwrap();
    assert_eq!(summary.product, "widget");
    assert_eq!(summary.quantity, 2);
    assert_eq!(summary.total_cents, 1998);
    assert_eq!(summary.status, "open");

    pipeline.stop().await;
}

#[tokio::test]
async fn reads_lag_until_the_projection_catches_up() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let receipt = pipeline
        .orders
        .submit(
            id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .await
        .unwrap();

    // Committed on the write side, not yet dispatched: a read is stale
    // and that is a normal outcome, not an error.
    assert!(matches!(
        pipeline.queries.get(&id).await,
        Err(QueryError::NotFound { .. })
    ));

    pipeline.sync_to(&id, receipt.sequence).await;
    assert!(pipeline.queries.get(&id).await.is_ok());

    pipeline.stop().await;
}

#[tokio::test]
async fn concurrent_writers_conflict_exactly_once() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let create = |quantity| OrderCommand::Create {
        product: "widget".to_string(),
        quantity,
        price_cents: 999,
    };

    // Two writers race to create the same order with the same observed
    // version; the loser gets a conflict and no second event exists.
    let (first, second) = tokio::join!(
        pipeline
            .orders
            .submit(id.clone(), Some(Version::INITIAL), create(2)),
        pipeline
            .orders
            .submit(id.clone(), Some(Version::INITIAL), create(9)),
    );

    let outcomes = [&first, &second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(CommandError::Conflict { .. })))
            .count(),
        1
    );

    let rows = store::scan_one(&pipeline.command_store, keys::OUTBOX_PREFIX, None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn quantity_change_reprojects_the_total() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let created = pipeline
        .orders
        .submit(
            id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .await
        .unwrap();
    let changed = pipeline
        .orders
        .submit(
            id.clone(),
            Some(created.version),
            OrderCommand::ChangeQuantity { quantity: 5 },
        )
        .await
        .unwrap();

    pipeline.sync_to(&id, changed.sequence).await;

    let summary = pipeline.queries.get(&id).await.unwrap();
    assert_eq!(summary.quantity, 5);
    assert_eq!(summary.total_cents, 4995);

    pipeline.stop().await;
}

#[tokio::test]
async fn cancelled_orders_stay_listable() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let created = pipeline
        .orders
        .submit(
            id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .await
        .unwrap();
    let cancelled = pipeline
        .orders
        .submit(
            id.clone(),
            Some(created.version),
            OrderCommand::Cancel {
                reason: "changed my mind".to_string(),
            },
        )
        .await
        .unwrap();

    pipeline.sync_to(&id, cancelled.sequence).await;

    let summary = pipeline.queries.get(&id).await.unwrap();
    assert_eq!(summary.status, "cancelled");

    let listed = pipeline
        .queries
        .list(|summary| summary.status == "cancelled")
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn validation_failure_emits_nothing() {
    let pipeline = Pipeline::start().await;
    let id = AggregateId::new("order-1");

    let result = pipeline
        .orders
        .submit(
            id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 0,
                price_cents: 999,
            },
        )
        .await;

    assert!(matches!(result, Err(CommandError::Validation(_))));
    assert!(pipeline.command_store.is_empty().await);

    pipeline.stop().await;
}

#[tokio::test]
async fn dispatcher_run_loop_drains_on_shutdown() {
    let command_store = InMemoryStore::new();
    let clock = Arc::new(test_clock());
    let bus = Arc::new(InProcessEventBus::new(64));
    let subscription = bus.subscribe("order-summary").await.unwrap();

    let orders = CommandHandler::<Order>::new(Arc::new(command_store.clone()), clock);
    orders
        .submit(
            AggregateId::new("order-1"),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 1,
                price_cents: 100,
            },
        )
        .await
        .unwrap();

    let (mut dispatcher, shutdown) = OutboxDispatcher::new(
        Arc::new(command_store.clone()),
        bus.clone() as Arc<dyn EventBus>,
    );
    let task = tokio::spawn(async move { dispatcher.run().await });

    // Shut down immediately; the final drain must still publish the row.
    shutdown.send(true).ok();
    task.await.unwrap().unwrap();

    use dualis_core::bus::Subscription as _;
    let delivery = subscription.next().await.unwrap();
    assert_eq!(delivery.envelope.event_type, "OrderCreated.v1");
    subscription.ack(delivery.tag).await.unwrap();
}
