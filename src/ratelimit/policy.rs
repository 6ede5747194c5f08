//! Rate limit policies and checkpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Longest window a policy may configure (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// A rate limit policy: at most `limit` operations per `duration` seconds.
///
/// A `limit` of `-1` (or `0`) on a global default means the checkpoint is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum operations allowed in the window
    pub limit: i64,
    /// Window length in seconds
    pub duration: u64,
    /// Path into the authenticated identity used as the subject (identity checkpoint only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_path: Option<String>,
}

impl RateLimitPolicy {
    /// Create a new policy without an identity path.
    pub fn new(limit: i64, duration: u64) -> Self {
        Self {
            limit,
            duration,
            id_path: None,
        }
    }

    /// Create a policy for the identity checkpoint.
    pub fn with_id_path(limit: i64, duration: u64, id_path: impl Into<String>) -> Self {
        Self {
            limit,
            duration,
            id_path: Some(id_path.into()),
        }
    }

    /// A disabled policy (`limit = -1`).
    pub fn disabled() -> Self {
        Self::new(-1, 1)
    }

    /// Whether this policy limits anything at all.
    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    /// Reject durations that cannot form a window.
    ///
    /// `name` identifies the policy in the error message.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.duration == 0 {
            return Err(GatekeeperError::Config(format!(
                "{} has a zero duration",
                name
            )));
        }
        if self.duration > MAX_DURATION_SECS {
            return Err(GatekeeperError::Config(format!(
                "{} duration {}s exceeds the maximum of {}s",
                name, self.duration, MAX_DURATION_SECS
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A point in request processing where a policy may be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Before authentication, keyed by client network address
    Ip,
    /// After authentication, keyed by authenticated identity
    Auth,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Ip => write!(f, "ip"),
            Checkpoint::Auth => write!(f, "auth"),
        }
    }
}
