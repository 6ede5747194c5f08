//! Per-route policy overrides.
//!
//! Routes are declared in YAML:
//!
//! ```yaml
//! routes:
//!   - method: GET
//!     path: /users/{id}
//!     ip:
//!       limit: 100
//!       duration: 60
//!     auth:
//!       limit: 1000
//!       duration: 3600
//!       id_path: auth.credentials.id
//! ```
//!
//! A route is matched on the resolved route path (the template, not the
//! request URI) and method. Method `*` matches any method.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::policy::{Checkpoint, RateLimitPolicy};
use crate::error::{GatekeeperError, Result};

/// A table of per-route overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub routes: Vec<RoutePolicies>,
}

/// The overrides configured for one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePolicies {
    /// HTTP method, or `*` for any
    #[serde(default = "any_method")]
    pub method: String,
    /// Route path template
    pub path: String,
    /// Override for the address-based checkpoint
    #[serde(default)]
    pub ip: Option<RateLimitPolicy>,
    /// Override for the identity-based checkpoint
    #[serde(default)]
    pub auth: Option<RateLimitPolicy>,
}

fn any_method() -> String {
    "*".to_string()
}

impl RoutePolicies {
    /// The override for a checkpoint, if configured.
    pub fn policy(&self, checkpoint: Checkpoint) -> Option<&RateLimitPolicy> {
        match checkpoint {
            Checkpoint::Ip => self.ip.as_ref(),
            Checkpoint::Auth => self.auth.as_ref(),
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        self.path == path && (self.method == "*" || self.method.eq_ignore_ascii_case(method))
    }
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: RouteTable = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse route policies: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    /// Find the overrides for a route.
    ///
    /// An exact method match wins over a `*` entry for the same path.
    pub fn find(&self, method: &str, path: &str) -> Option<&RoutePolicies> {
        let mut wildcard = None;
        for route in self.routes.iter().filter(|r| r.matches(method, path)) {
            if route.method != "*" {
                return Some(route);
            }
            if wildcard.is_none() {
                wildcard = Some(route);
            }
        }
        wildcard
    }

    fn validate(&self) -> Result<()> {
        for route in &self.routes {
            for policy in [&route.ip, &route.auth].into_iter().flatten() {
                policy.validate(&format!("route {} {}", route.method, route.path))?;
            }
        }
        Ok(())
    }
}
