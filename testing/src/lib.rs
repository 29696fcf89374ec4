//! # Dualis Testing
//!
//! Testing utilities for Dualis:
//!
//! - [`InMemoryStore`]: transactional store over a `BTreeMap`, usable as
//!   either the command store or the query store in tests
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - [`StubSubscription`]: scripted deliveries for consumer tests, with
//!   out-of-order redelivery on nack

pub mod clock;
pub mod store;
pub mod subscription;

pub use clock::{FixedClock, test_clock};
pub use store::InMemoryStore;
pub use subscription::StubSubscription;
