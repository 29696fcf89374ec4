//! Time abstraction for testable event timestamps.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// The command handler stamps `occurred_at` through a `Clock` so tests can
/// pin event timestamps. See `dualis-testing` for a deterministic
/// `FixedClock`.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
