//! Quota metadata exposed to clients.

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Header carrying the window's ceiling.
pub const HEADER_LIMIT: &str = "x-rate-limit-limit";
/// Header carrying the requests left in the window.
pub const HEADER_REMAINING: &str = "x-rate-limit-remaining";
/// Header carrying the window reset as Unix epoch seconds.
pub const HEADER_RESET: &str = "x-rate-limit-reset";

/// The quota attached to an in-flight request after a checkpoint applied a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestQuota {
    pub limit: i64,
    /// Requests left after this one; `-1` once the limit is exceeded
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl RequestQuota {
    /// Set the three `X-Rate-Limit-*` headers, replacing existing values.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static(HEADER_LIMIT), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(HEADER_REMAINING),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static(HEADER_RESET),
            HeaderValue::from(self.reset_at.timestamp()),
        );
    }
}
