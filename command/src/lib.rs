//! Write side of Dualis: command handling and outbox dispatch.
//!
//! [`CommandHandler`] validates commands against current aggregate state
//! and commits the new state together with an outbox row in a single
//! transaction. [`OutboxDispatcher`] runs as a background task, publishing
//! committed rows to the event bus and advancing a persistent cursor so
//! dispatch survives restarts.
//!
//! The two halves share nothing but the store: the handler never touches
//! the bus, and the dispatcher never touches aggregates.

pub mod handler;
pub mod outbox;

pub use handler::{CommandError, CommandHandler, Receipt};
pub use outbox::{OutboxDispatcher, OutboxEntry, OutboxError};
