//! Counter store trait for abstracting local and remote backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::key::RateLimitKey;
use super::policy::MAX_DURATION_SECS;
use crate::error::{GatekeeperError, Result};

/// The state of a window right after one unit of usage was counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStatus {
    /// The just-incremented count for this window
    pub count: u64,
    /// The ceiling the count was checked against
    pub limit: i64,
    /// Quota available before this hit was counted, never negative
    pub remaining: i64,
    /// When the window expires and the count restarts
    pub reset_at: DateTime<Utc>,
}

impl WindowStatus {
    /// Build a status from a count, deriving `remaining`.
    pub fn new(count: u64, limit: i64, reset_at: DateTime<Utc>) -> Self {
        let remaining = (limit - count as i64 + 1).max(0);
        Self {
            count,
            limit,
            remaining,
            reset_at,
        }
    }
}

/// Window length in milliseconds, as armed in the store.
///
/// Zero windows and windows longer than [`MAX_DURATION_SECS`] are refused:
/// the first would never hold a count, the second cannot be represented.
pub fn window_millis(window: Duration) -> Result<i64> {
    i64::try_from(window.as_millis())
        .ok()
        .filter(|ms| *ms > 0 && window.as_secs() <= MAX_DURATION_SECS)
        .ok_or_else(|| {
            GatekeeperError::Config(format!("window of {:?} is out of range", window))
        })
}

/// When a window armed at `now` expires.
pub fn window_expiry(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    let millis = window_millis(window)?;
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .ok_or_else(|| {
            GatekeeperError::Config(format!("window of {}ms overflows the clock", millis))
        })
}

/// Trait for counter store implementations.
///
/// Implementations must make the increment and the arming of the window
/// expiry a single atomic step: concurrent callers on the same key observe
/// strictly serialized counts, and only the caller that moves the counter
/// from absent/expired to 1 sets the expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one unit of usage against `key` in a window of `window` length.
    async fn increment(
        &self,
        key: &RateLimitKey,
        limit: i64,
        window: Duration,
    ) -> Result<WindowStatus>;
}
