//! # Dualis Core
//!
//! Core traits and types for Dualis, a single-process CQRS synchronization
//! library: a write-optimized command model and a read-optimized query
//! model kept eventually consistent through asynchronous domain events.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    one transaction     ┌──────────────────┐
//! │ Command Handler │ ─────────────────────▶ │  Command Store   │
//! └─────────────────┘  aggregate + outbox    │  (agg + outbox)  │
//!                                            └────────┬─────────┘
//!                                                     │ poll
//!                                                     ▼
//!                                            ┌──────────────────┐
//!                                            │ OutboxDispatcher │
//!                                            └────────┬─────────┘
//!                                                     │ publish
//!                                                     ▼
//!                                            ┌──────────────────┐
//!                                            │    Event Bus     │ at-least-once,
//!                                            └────────┬─────────┘ ordered per aggregate
//!                                                     │ ack/nack
//!                                                     ▼
//! ┌─────────────────┐                        ┌──────────────────┐
//! │  Query Handler  │ ◀───────────────────── │ Projection Engine│
//! └─────────────────┘   reads models only    │ (checkpointed)   │
//!                                            └──────────────────┘
//! ```
//!
//! ## Core Concepts
//!
//! - **Aggregate**: write-side consistency boundary, mutated through
//!   validated commands ([`aggregate`])
//! - **Event envelope**: immutable fact with a per-aggregate sequence
//!   number ([`event`])
//! - **Transactional store**: the minimal begin/get/put/commit contract
//!   both stores hide behind ([`store`])
//! - **Event bus**: at-least-once, per-aggregate-ordered delivery with
//!   explicit ack/nack ([`bus`])
//! - **Projection transform**: pure, compile-time-closed mapping from
//!   events to read models ([`projection`])

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod bus;
pub mod clock;
pub mod event;
pub mod keys;
pub mod projection;
pub mod store;
