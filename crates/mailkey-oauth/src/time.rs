//! Wall-clock abstraction for testability.
//!
//! Token expiry is an absolute instant that survives process restarts, so the
//! broker works with `DateTime<Utc>` rather than monotonic `Instant`s.
//!
//! # Example
//!
//! ```
//! use chrono::{Duration, TimeZone, Utc};
//! use mailkey_oauth::time::{Clock, MockClock};
//!
//! let clock = MockClock::at(Utc.timestamp_opt(1_000, 0).unwrap());
//! clock.advance(Duration::seconds(5));
//! assert_eq!(clock.now().timestamp(), 1_005);
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
///
/// In production, use [`SystemClock`]. In tests, use [`MockClock`] to pin
/// "now" to a known instant.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock that uses real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    /// Creates a clock frozen at `instant`.
    #[must_use]
    pub const fn at(instant: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(instant),
        }
    }

    /// Creates a clock that can be shared with a broker and still driven by the test.
    #[must_use]
    pub fn shared(instant: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::at(instant))
    }

    /// Moves the clock forward (or backward, for negative durations).
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jumps the clock to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for Arc<MockClock> {
    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_clock() {
        let before = Utc::now();
        let from_clock = SystemClock.now();
        let after = Utc::now();

        assert!(from_clock >= before);
        assert!(from_clock <= after);
    }

    #[test]
    fn test_mock_clock_advance_and_set() {
        let clock = MockClock::at(Utc.timestamp_opt(1000, 0).unwrap());
        clock.advance(Duration::seconds(300));
        assert_eq!(clock.now().timestamp(), 1300);

        clock.set(Utc.timestamp_opt(42, 0).unwrap());
        assert_eq!(clock.now().timestamp(), 42);
    }

    #[test]
    fn test_shared_mock_clock() {
        let clock = MockClock::shared(Utc.timestamp_opt(0, 0).unwrap());
        let clock2 = Arc::clone(&clock);

        clock2.advance(Duration::seconds(10));
        assert_eq!(clock.now().timestamp(), 10);
    }
}
