//! Order processing demo for Dualis.
//!
//! The canonical walkthrough of the full pipeline: the [`Order`] aggregate
//! on the write side, the [`OrderProjection`] read model on the query
//! side, and the integration tests wiring them through the command
//! handler, outbox dispatcher, in-process bus, and projection engine.
//!
//! [`Order`]: order::Order
//! [`OrderProjection`]: projection::OrderProjection

pub mod order;
pub mod projection;

pub use order::{Order, OrderCommand, OrderEvent, OrderStatus};
pub use projection::{OrderProjection, OrderSummary};
