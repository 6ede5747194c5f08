//! Configuration management for Gatekeeper.
//!
//! Settings are merged once at startup: built-in defaults, then an optional
//! file, then `GATEKEEPER_*` environment variables (`__` separates nested
//! keys, e.g. `GATEKEEPER_GLOBAL__IP__LIMIT=100`). The resulting struct is
//! immutable and shared with the limiter.

use config::{Config, Environment, File, FileFormat};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RateLimitPolicy;

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Prefix for every counter key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Default policies applied when a route has no override
    #[serde(default)]
    pub global: GlobalPolicies,

    /// Counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Path to the per-route policy table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes_path: Option<String>,

    /// What the identity checkpoint does when the identity path is unresolved
    #[serde(default)]
    pub missing_identity: MissingIdentity,

    /// How a route override with `limit <= 0` is treated
    #[serde(default)]
    pub non_positive_override: NonPositiveOverride,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            global: GlobalPolicies::default(),
            store: StoreConfig::default(),
            routes_path: None,
            missing_identity: MissingIdentity::default(),
            non_positive_override: NonPositiveOverride::default(),
        }
    }
}

fn default_namespace() -> String {
    "clhr".to_string()
}

/// Process-wide default policies, one per checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPolicies {
    /// Policy for the address-based checkpoint
    #[serde(default)]
    pub ip: RateLimitPolicy,

    /// Policy for the identity-based checkpoint
    #[serde(default)]
    pub auth: RateLimitPolicy,
}

impl Default for GlobalPolicies {
    fn default() -> Self {
        Self {
            ip: RateLimitPolicy::disabled(),
            auth: RateLimitPolicy::disabled(),
        }
    }
}

/// Counter store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Full connection URL; takes precedence over host/port/password/db
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Upper bound for a single store round trip in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_store_host(),
            port: default_store_port(),
            password: None,
            db: 0,
            command_timeout_ms: None,
        }
    }
}

fn default_store_host() -> String {
    "127.0.0.1".to_string()
}

fn default_store_port() -> u16 {
    6379
}

impl StoreConfig {
    /// Redis connection parameters for these settings.
    ///
    /// The password is handed over as-is, never spliced into a URL.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        if let Some(ref url) = self.url {
            return url
                .as_str()
                .into_connection_info()
                .map_err(|e| GatekeeperError::Config(format!("Invalid store url: {}", e)));
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        })
    }

    /// The configured command timeout, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

/// Behavior of the identity checkpoint when the identity path does not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingIdentity {
    /// Limit under a shared placeholder subject
    #[default]
    Shared,
    /// Fail the checkpoint without touching the store
    Reject,
}

/// Behavior of a route override whose limit is zero or negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonPositiveOverride {
    /// Apply it; every request on the route is rejected
    #[default]
    Reject,
    /// Treat it like a disabled global default
    Disable,
}

impl GatekeeperConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("GATEKEEPER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Self>()?;

        config.validate()?;
        Ok(config)
    }

    /// Merge a YAML document over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Self>()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the global policies the way route overrides are checked.
    pub fn validate(&self) -> Result<()> {
        self.global.ip.validate("global.ip")?;
        self.global.auth.validate("global.auth")?;
        Ok(())
    }
}
