//! Gateway error responses.
//!
//! # Responsibilities
//! - Map request-time failures to HTTP status codes
//! - Attach `Retry-After` and `X-RateLimit-*` headers to 429s
//!
//! # Status mapping
//! ```text
//! RouteNotFound       → 404
//! RateLimitExceeded   → 429 (+ Retry-After when waiting helps)
//! UpstreamTimeout     → 504
//! UpstreamUnavailable → 502
//! CircuitOpen         → 503
//! FallbackFailed      → 502
//! BodyTooLarge        → 413
//! ```

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

use crate::http::client::DispatchError;
use crate::routing::table::RouteNotFound;
use crate::security::rate_limit::RateLimiterConfig;

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_REPLENISH_RATE: HeaderName = HeaderName::from_static("x-ratelimit-replenish-rate");
pub const X_RATELIMIT_BURST_CAPACITY: HeaderName = HeaderName::from_static("x-ratelimit-burst-capacity");
pub const X_RATELIMIT_REQUESTED_TOKENS: HeaderName = HeaderName::from_static("x-ratelimit-requested-tokens");

/// A request-time failure surfaced to the client.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    RouteNotFound(#[from] RouteNotFound),

    #[error("rate limit exceeded")]
    RateLimitExceeded {
        retry_after: Option<Duration>,
        remaining: f64,
        limits: RateLimiterConfig,
    },

    #[error("upstream timed out after {}ms", .0.as_millis())]
    UpstreamTimeout(Duration),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] DispatchError),

    #[error("circuit open for route '{0}'")]
    CircuitOpen(String),

    #[error("fallback route '{fallback}' failed: {reason}")]
    FallbackFailed { fallback: String, reason: String },

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::FallbackFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Whole seconds to wait, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_secs_f64().ceil() as u64).max(1)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let mut response = Response::new(Body::from(self.to_string()));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

        if let ProxyError::RateLimitExceeded {
            retry_after,
            remaining,
            limits,
        } = &self
        {
            if let Some(retry_after) = retry_after {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
            }
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining.max(0.0).floor() as u64));
            headers.insert(X_RATELIMIT_REPLENISH_RATE, HeaderValue::from(limits.replenish_rate));
            headers.insert(X_RATELIMIT_BURST_CAPACITY, HeaderValue::from(limits.burst_capacity));
            headers.insert(X_RATELIMIT_REQUESTED_TOKENS, HeaderValue::from(limits.requested_tokens));
        }

        response
    }
}
