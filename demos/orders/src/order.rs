//! The Order aggregate: commands, events, and the decision function.

use serde::{Deserialize, Serialize};

use dualis_core::aggregate::{Aggregate, Rejection};
use dualis_core::event::Event;

/// Lifecycle state of an order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepting changes.
    Open,
    /// Terminal; no further commands are accepted.
    Cancelled,
}

/// Write-side state of one order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    /// What was ordered.
    pub product: String,
    /// How many units.
    pub quantity: u32,
    /// Unit price in cents.
    pub price_cents: u64,
    /// Current lifecycle state.
    pub status: OrderStatus,
}

/// Commands accepted by the Order aggregate.
#[derive(Clone, Debug)]
pub enum OrderCommand {
    /// Create a new order.
    Create {
        /// What is being ordered.
        product: String,
        /// How many units; must be positive.
        quantity: u32,
        /// Unit price in cents.
        price_cents: u64,
    },
    /// Change the quantity of an open order.
    ChangeQuantity {
        /// The new quantity; must be positive.
        quantity: u32,
    },
    /// Cancel an open order.
    Cancel {
        /// Why the order was cancelled.
        reason: String,
    },
}

/// Events emitted by the Order aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    /// A new order was created.
    OrderCreated {
        /// What was ordered.
        product: String,
        /// How many units.
        quantity: u32,
        /// Unit price in cents.
        price_cents: u64,
    },
    /// The quantity of an open order changed.
    QuantityChanged {
        /// The new quantity.
        quantity: u32,
    },
    /// The order was cancelled.
    OrderCancelled {
        /// Why the order was cancelled.
        reason: String,
    },
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated { .. } => "OrderCreated.v1",
            OrderEvent::QuantityChanged { .. } => "OrderQuantityChanged.v1",
            OrderEvent::OrderCancelled { .. } => "OrderCancelled.v1",
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;

    fn aggregate_type() -> &'static str {
        "order"
    }

    fn handle(
        state: Option<&Self>,
        command: Self::Command,
    ) -> Result<(Self, Self::Event), Rejection> {
        match (state, command) {
            (Some(_), OrderCommand::Create { .. }) => Err(Rejection::new(
                "order-exists",
                "order has already been created",
            )),
            (
                None,
                OrderCommand::Create {
                    product,
                    quantity,
                    price_cents,
                },
            ) => {
                if product.trim().is_empty() {
                    return Err(Rejection::new("product-required", "product must be named"));
                }
                if quantity == 0 {
                    return Err(Rejection::new(
                        "quantity-positive",
                        "quantity must be positive",
                    ));
                }
                Ok((
                    Self {
                        product: product.clone(),
                        quantity,
                        price_cents,
                        status: OrderStatus::Open,
                    },
                    OrderEvent::OrderCreated {
                        product,
                        quantity,
                        price_cents,
                    },
                ))
            }
            (None, _) => Err(Rejection::new("order-missing", "order does not exist")),
            (Some(order), OrderCommand::ChangeQuantity { quantity }) => {
                if order.status == OrderStatus::Cancelled {
                    return Err(Rejection::new(
                        "order-cancelled",
                        "cancelled orders cannot change",
                    ));
                }
                if quantity == 0 {
                    return Err(Rejection::new(
                        "quantity-positive",
                        "quantity must be positive",
                    ));
                }
                Ok((
                    Self {
                        quantity,
                        ..order.clone()
                    },
                    OrderEvent::QuantityChanged { quantity },
                ))
            }
            (Some(order), OrderCommand::Cancel { reason }) => {
                if order.status == OrderStatus::Cancelled {
                    return Err(Rejection::new(
                        "order-cancelled",
                        "order is already cancelled",
                    ));
                }
                Ok((
                    Self {
                        status: OrderStatus::Cancelled,
                        ..order.clone()
                    },
                    OrderEvent::OrderCancelled { reason },
                ))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can panic
mod tests {
    use super::*;

    fn open_order() -> Order {
        Order {
            product: "widget".to_string(),
            quantity: 2,
            price_cents: 999,
            status: OrderStatus::Open,
        }
    }

    #[test]
    fn create_emits_order_created() {
        let (order, event) = Order::handle(
            None,
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 2,
                price_cents: 999,
            },
        )
        .unwrap_or_else(|e| panic!("create rejected: {e}"));

        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(event.event_type(), "OrderCreated.v1");
    }

    #[test]
    fn create_rejects_zero_quantity() {
        let result = Order::handle(
            None,
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 0,
                price_cents: 999,
            },
        );
        assert_eq!(result.map(|_| ()).map_err(|e| e.rule), Err("quantity-positive"));
    }

    #[test]
    fn create_twice_is_rejected() {
        let result = Order::handle(
            Some(&open_order()),
            OrderCommand::Create {
                product: "widget".to_string(),
                quantity: 1,
                price_cents: 1,
            },
        );
        assert_eq!(result.map(|_| ()).map_err(|e| e.rule), Err("order-exists"));
    }

    #[test]
    fn cancelled_order_is_frozen() {
        let cancelled = Order {
            status: OrderStatus::Cancelled,
            ..open_order()
        };
        let result = Order::handle(Some(&cancelled), OrderCommand::ChangeQuantity { quantity: 3 });
        assert_eq!(result.map(|_| ()).map_err(|e| e.rule), Err("order-cancelled"));

        let result = Order::handle(
            Some(&cancelled),
            OrderCommand::Cancel {
                reason: "again".to_string(),
            },
        );
        assert_eq!(result.map(|_| ()).map_err(|e| e.rule), Err("order-cancelled"));
    }

    #[test]
    fn change_quantity_updates_state() {
        let (order, event) = Order::handle(
            Some(&open_order()),
            OrderCommand::ChangeQuantity { quantity: 7 },
        )
        .unwrap_or_else(|e| panic!("change rejected: {e}"));

        assert_eq!(order.quantity, 7);
        assert_eq!(event, OrderEvent::QuantityChanged { quantity: 7 });
    }
}
