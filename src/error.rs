//! Error types for the Gatekeeper rate limiter.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Response, StatusCode};
use thiserror::Error;

use crate::ratelimit::RequestQuota;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// The counter store could not be reached or answered with a protocol error
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The counter for the resolved key has reached its ceiling in this window
    #[error("Rate limit exceeded")]
    LimitExceeded(RequestQuota),

    /// The identity path did not resolve and the checkpoint is configured to fail
    #[error("Identity path '{path}' did not resolve")]
    MissingIdentity { path: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

impl GatekeeperError {
    /// HTTP status a host should answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatekeeperError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatekeeperError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatekeeperError::MissingIdentity { .. } => StatusCode::UNAUTHORIZED,
            GatekeeperError::Config(_) | GatekeeperError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Headers carried by the error's own response.
    ///
    /// Only a rejection carries quota headers; every other error yields an empty map.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let GatekeeperError::LimitExceeded(quota) = self {
            quota.apply_headers(&mut headers);
        }
        headers
    }

    /// Whether this error is a rate limit rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatekeeperError::LimitExceeded(_))
    }

    /// Render the error as a client-facing HTTP response.
    pub fn into_response(self) -> Response<String> {
        let status = self.status_code();
        let message = match &self {
            // Server-side details stay out of the payload
            GatekeeperError::Config(_) | GatekeeperError::Io(_) => {
                "An internal server error occurred".to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "statusCode": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Unknown"),
            "message": message,
        });

        let mut response = Response::new(body.to_string());
        *response.status_mut() = status;
        *response.headers_mut() = self.headers();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
