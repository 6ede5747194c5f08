//! Request context and subject extraction.

use http::HeaderMap;
use serde_json::Value;
use std::net::IpAddr;

use super::quota::RequestQuota;

/// Forwarded-for header consulted for the client address.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// What the limiter needs from the host's in-flight request.
pub trait RequestContext: Send {
    /// Inbound request headers.
    fn headers(&self) -> &HeaderMap;

    /// Transport-level peer address, if known.
    fn remote_addr(&self) -> Option<IpAddr>;

    /// Method of the resolved route.
    fn method(&self) -> &str;

    /// Path template of the resolved route.
    fn route_path(&self) -> &str;

    /// Resolve a dotted path into the authenticated identity.
    fn reach(&self, path: &str) -> Option<String>;

    /// The quota recorded by the last checkpoint that applied a policy.
    fn quota(&self) -> Option<&RequestQuota>;

    /// Record the quota for later header decoration.
    fn set_quota(&mut self, quota: RequestQuota);
}

/// The apparent client address.
///
/// The first entry of `X-Forwarded-For` wins over the transport address.
pub fn client_address<C: RequestContext + ?Sized>(ctx: &C) -> Option<String> {
    let forwarded = ctx
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(addr) => Some(addr.to_string()),
        None => ctx.remote_addr().map(|addr| addr.to_string()),
    }
}

/// Resolve a dotted path such as `auth.credentials.id` in a JSON document.
///
/// Numeric segments index into arrays. Strings are returned as-is, other
/// scalars in their JSON form; `null`, objects and arrays do not resolve.
pub fn reach_value(root: &Value, path: &str) -> Option<String> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

/// A self-contained request context.
///
/// Hosts that do not want to implement [`RequestContext`] on their own
/// request type can fill one of these per request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub headers: HeaderMap,
    pub remote_addr: Option<IpAddr>,
    pub method: String,
    pub route_path: String,
    /// The request as seen after authentication, e.g. `{"auth": {"credentials": {...}}}`
    pub identity: Value,
    pub quota: Option<RequestQuota>,
}

impl RequestInfo {
    /// Create a context for a resolved route.
    pub fn new(method: impl Into<String>, route_path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            route_path: route_path.into(),
            ..Self::default()
        }
    }

    /// Set the transport-level peer address.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the authenticated identity document.
    pub fn with_identity(mut self, identity: Value) -> Self {
        self.identity = identity;
        self
    }
}

impl RequestContext for RequestInfo {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    fn method(&self) -> &str {
        &self.method
    }

    fn route_path(&self) -> &str {
        &self.route_path
    }

    fn reach(&self, path: &str) -> Option<String> {
        reach_value(&self.identity, path)
    }

    fn quota(&self) -> Option<&RequestQuota> {
        self.quota.as_ref()
    }

    fn set_quota(&mut self, quota: RequestQuota) {
        self.quota = Some(quota);
    }
}
