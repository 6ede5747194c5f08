//! Wall clock abstraction.
//!
//! Window resets are absolute timestamps reported to clients, so the clock
//! yields `DateTime<Utc>` rather than a monotonic `Instant`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock using `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for tests.
///
/// Clones share the same time, so advancing one advances all of them.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration, saturating at the end of time.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.current_time.lock();
        let delta = i64::try_from(duration.as_millis())
            .ok()
            .and_then(chrono::Duration::try_milliseconds);
        *time = delta
            .and_then(|delta| time.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Set the clock to a specific time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock() = time;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock()
    }
}
