//! # Dualis Bus
//!
//! The in-process [`EventBus`](dualis_core::bus::EventBus) implementation:
//! at-least-once delivery with explicit ack/nack, per-aggregate ordering,
//! and bounded per-subscriber queues.
//!
//! See [`InProcessEventBus`] for the delivery model.

pub mod in_process;

pub use in_process::{DEFAULT_CAPACITY, InProcessEventBus, InProcessSubscription};
