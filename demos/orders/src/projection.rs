//! The order-summary read model and its projection transform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dualis_core::event::EventEnvelope;
use dualis_core::projection::{Applied, ProjectionTransform, TransformError};

use crate::order::OrderEvent;

/// Query-side view of one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    /// The order's aggregate ID.
    pub order_id: String,
    /// What was ordered.
    pub product: String,
    /// How many units.
    pub quantity: u32,
    /// Unit price in cents.
    pub price_cents: u64,
    /// `quantity * price_cents`, precomputed for display.
    pub total_cents: u64,
    /// `"open"` or `"cancelled"`.
    pub status: String,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
    /// When the last event was applied.
    pub updated_at: DateTime<Utc>,
}

/// Projects order events into [`OrderSummary`] rows.
///
/// Cancellation keeps the row with status `"cancelled"` instead of
/// deleting it, so cancelled orders remain listable.
pub struct OrderProjection;

impl ProjectionTransform for OrderProjection {
    type Event = OrderEvent;
    type Model = OrderSummary;

    fn name(&self) -> &'static str {
        "order-summary"
    }

    fn apply(
        &self,
        current: Option<OrderSummary>,
        event: &OrderEvent,
        envelope: &EventEnvelope,
    ) -> Result<Applied<OrderSummary>, TransformError> {
        match (current, event) {
            (
                None,
                OrderEvent::OrderCreated {
                    product,
                    quantity,
                    price_cents,
                },
            ) => Ok(Applied::Upsert(OrderSummary {
                order_id: envelope.aggregate_id.to_string(),
                product: product.clone(),
                quantity: *quantity,
                price_cents: *price_cents,
                total_cents: u64::from(*quantity) * price_cents,
                status: "open".to_string(),
                created_at: envelope.occurred_at,
                updated_at: envelope.occurred_at,
            })),
            (Some(summary), OrderEvent::QuantityChanged { quantity }) => {
                Ok(Applied::Upsert(OrderSummary {
                    quantity: *quantity,
                    total_cents: u64::from(*quantity) * summary.price_cents,
                    updated_at: envelope.occurred_at,
                    ..summary
                }))
            }
            (Some(summary), OrderEvent::OrderCancelled { .. }) => {
                Ok(Applied::Upsert(OrderSummary {
                    status: "cancelled".to_string(),
                    updated_at: envelope.occurred_at,
                    ..summary
                }))
            }
            (current, event) => Err(TransformError::new(
                "order-summary",
                envelope.event_type.clone(),
                format!("event {event:?} unexpected against {current:?}"),
            )),
        }
    }
}
