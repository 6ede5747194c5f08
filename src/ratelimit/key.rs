//! Rate limit key derivation.

use std::fmt;

/// A key that uniquely identifies a counter in the store.
///
/// The key is composed of the namespace, the subject, the HTTP method and
/// the route path, joined with `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Deployment-wide namespace prefix
    pub namespace: String,
    /// Client address or authenticated identity
    pub subject: String,
    /// HTTP method of the resolved route
    pub method: String,
    /// Path of the resolved route
    pub path: String,
}

impl RateLimitKey {
    /// Create a new key.
    pub fn new(namespace: &str, subject: &str, method: &str, path: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            subject: subject.to_string(),
            method: method.to_string(),
            path: path.to_string(),
        }
    }

    /// The string used to address the counter in the store.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.namespace, self.subject, self.method, self.path
        )
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
