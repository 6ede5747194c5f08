//! Redis-backed counter store.
//!
//! Each key maps to a Redis hash with two fields:
//! - `count`: hits in the current window
//! - `reset`: window expiry as Unix epoch milliseconds
//!
//! The hash carries a `PEXPIRE` equal to the window length, so Redis drops
//! it when the window ends and the next hit starts a fresh one. The whole
//! increment runs in a single Lua script, which Redis executes atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::store::{window_expiry, window_millis, CounterStore, WindowStatus};
use crate::config::StoreConfig;
use crate::error::{GatekeeperError, Result};

/// Increments the window counter, arming the expiry on the first hit.
///
/// KEYS[1] = counter key, ARGV[1] = now (ms), ARGV[2] = window (ms).
/// Returns `{count, reset_ms}`.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
local reset = tonumber(redis.call('HGET', KEYS[1], 'reset'))
if count == 1 or reset == nil or redis.call('PTTL', KEYS[1]) < 0 then
    reset = tonumber(ARGV[1]) + tonumber(ARGV[2])
    redis.call('HSET', KEYS[1], 'reset', reset)
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {count, reset}
"#;

/// Counter store shared across processes through Redis.
///
/// Holds one multiplexed connection for the lifetime of the process; clones
/// share it.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Arc<Script>,
    command_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the store section of the configuration.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the connection cannot be established.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.connection_info()?)?;
        let connection = ConnectionManager::new(client).await?;

        debug!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connected to counter store"
        );

        Ok(Self {
            connection,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            command_timeout: config.command_timeout(),
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Replace the clock used to stamp new windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check that the store answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let pong: String = self.bounded(cmd.query_async(&mut conn)).await?;
        trace!(reply = %pong, "Counter store answered ping");
        Ok(())
    }

    /// Run a store round trip under the configured command timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match self.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(GatekeeperError::from),
                Err(_) => Err(GatekeeperError::StoreUnavailable(format!(
                    "command timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => fut.await.map_err(GatekeeperError::from),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        key: &RateLimitKey,
        limit: i64,
        window: Duration,
    ) -> Result<WindowStatus> {
        let store_key = key.to_store_key();
        let now = self.clock.now();
        let window_ms = window_millis(window)?;
        // Keeps now + window inside the script representable
        window_expiry(now, window)?;
        let now_ms = now.timestamp_millis();

        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation.key(&store_key).arg(now_ms).arg(window_ms);

        let (count, reset_ms): (u64, i64) = self
            .bounded(invocation.invoke_async(&mut conn))
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Counter store increment failed");
                e
            })?;

        let reset_at = DateTime::<Utc>::from_timestamp_millis(reset_ms).ok_or_else(|| {
            GatekeeperError::StoreUnavailable(format!("invalid reset timestamp {}", reset_ms))
        })?;

        trace!(key = %key, count = count, reset_ms = reset_ms, "Counted hit");

        Ok(WindowStatus::new(count, limit, reset_at))
    }
}
