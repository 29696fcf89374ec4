//! Read side of Dualis: projection engine, dead-letter queue, queries.
//!
//! [`ProjectionEngine`] consumes an event bus subscription and maintains
//! one projection's read models with per-aggregate checkpoints, so
//! duplicate deliveries are skipped and out-of-order deliveries wait for
//! their predecessors. Events that exhaust their retry budget land in the
//! [`DeadLetterQueue`]. [`QueryHandler`] serves the resulting models.

pub mod dead_letter;
pub mod engine;
pub mod query;
pub mod retry;

pub use dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterQueue, DeadLetterStatus};
pub use engine::{EngineConfig, ProjectionEngine, ProjectionError};
pub use query::{QueryError, QueryHandler};
pub use retry::{RetryPolicy, retry_with_backoff};
