//! In-process counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::store::{window_expiry, CounterStore, WindowStatus};
use crate::error::Result;

/// The state of one counter window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Hits counted in the current window
    pub count: u64,
    /// When the current window expires
    pub expires_at: DateTime<Utc>,
}

impl WindowState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// How often increments sweep expired windows out of the map by default.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A counter store held in process memory.
///
/// Each increment runs while holding the shard lock of its key, which
/// serializes concurrent hits on the same key. Expired windows are swept
/// by whichever increment first notices the sweep interval has passed.
/// Suitable for a single process; use [`super::RedisStore`] to share
/// counters across instances.
pub struct MemoryStore {
    windows: DashMap<String, WindowState>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            windows: DashMap::new(),
            clock,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            last_sweep: Mutex::new(now),
        }
    }

    /// Change how often expired windows are swept.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Current window state for a key, if it has not expired.
    pub fn window(&self, key: &RateLimitKey) -> Option<WindowState> {
        let now = self.clock.now();
        self.windows
            .get(&key.to_store_key())
            .map(|entry| *entry.value())
            .filter(|state| !state.is_expired(now))
    }

    /// Drop every expired window.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Sweep if the interval has passed; concurrent callers skip.
    ///
    /// Must not be called while holding a map entry.
    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let Some(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        let due = (now - *last)
            .to_std()
            .map_or(false, |elapsed| elapsed >= self.sweep_interval);
        if !due {
            return;
        }
        *last = now;
        drop(last);

        let purged = self.purge_expired_at(now);
        if purged > 0 {
            debug!(purged = purged, "Swept expired counter windows");
        }
    }

    /// Number of tracked windows, expired ones included.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        limit: i64,
        window: Duration,
    ) -> Result<WindowStatus> {
        let now = self.clock.now();
        let expires_at = window_expiry(now, window)?;

        self.maybe_sweep(now);

        let state = {
            let mut entry = self
                .windows
                .entry(key.to_store_key())
                .or_insert(WindowState {
                    count: 0,
                    expires_at: now,
                });

            if entry.count == 0 || entry.is_expired(now) {
                entry.count = 1;
                entry.expires_at = expires_at;
                debug!(
                    key = %key,
                    expires_at = %entry.expires_at,
                    "Armed new counter window"
                );
            } else {
                entry.count += 1;
            }
            *entry
        };

        trace!(key = %key, count = state.count, "Counted hit");

        Ok(WindowStatus::new(state.count, limit, state.expires_at))
    }
}
