//! End-to-end demo: submit order commands, watch the projection catch up,
//! and query the summaries.
//!
//! ```sh
//! RUST_LOG=info cargo run -p orders-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use dualis_bus::InProcessEventBus;
use dualis_command::{CommandHandler, OutboxDispatcher};
use dualis_core::aggregate::{AggregateId, Version};
use dualis_core::bus::EventBus;
use dualis_core::clock::SystemClock;
use dualis_projection::{ProjectionEngine, QueryHandler};
use dualis_testing::InMemoryStore;

use orders_demo::{OrderCommand, OrderProjection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let command_store = Arc::new(InMemoryStore::new());
    let query_store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SystemClock);
    let bus = Arc::new(InProcessEventBus::new(1024));

    // Read side first, so the dispatcher never publishes into the void.
    let subscription = bus.subscribe("order-summary").await?;
    let (engine, engine_shutdown) =
        ProjectionEngine::new(OrderProjection, query_store.clone(), clock.clone());
    let engine_task = tokio::spawn(engine.run(subscription));

    let (mut dispatcher, dispatcher_shutdown) =
        OutboxDispatcher::new(command_store.clone(), bus.clone());
    let dispatcher_task = tokio::spawn(async move { dispatcher.run().await });

    let orders =
        CommandHandler::<orders_demo::Order>::new(command_store.clone(), clock.clone());

    let order_id = AggregateId::new("order-1");
    let receipt = orders
        .submit(
            order_id.clone(),
            Some(Version::INITIAL),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .await?;
    tracing::info!(version = %receipt.version, "Order created");

    let receipt = orders
        .submit(
            order_id.clone(),
            Some(receipt.version),
            OrderCommand::ChangeQuantity { quantity: 5 },
        )
        .await?;
    tracing::info!(version = %receipt.version, "Quantity changed");

    // Reads are eventually consistent; wait for the projection to catch up.
    let queries = QueryHandler::new(query_store.clone(), Arc::new(OrderProjection));
    let summary = loop {
        match queries.checkpoint(&order_id).await? {
            Some(checkpoint) if checkpoint.sequence == receipt.sequence => {
                break queries.get(&order_id).await?;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    tracing::info!(
        product = %summary.product,
        quantity = summary.quantity,
        total_cents = summary.total_cents,
        status = %summary.status,
        "Projected order summary"
    );

    dispatcher_shutdown.send(true).ok();
    dispatcher_task
        .await
        .context("dispatcher task panicked")?
        .context("dispatcher failed")?;
    bus.shutdown();
    engine_shutdown.send(true).ok();
    engine_task.await.context("engine task panicked")?;

    Ok(())
}
