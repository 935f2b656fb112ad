//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Route definitions, evaluated in declaration order.
    pub routes: Vec<RouteConfig>,

    /// Named key resolvers referenced by `rate_limit` filters.
    pub key_resolvers: BTreeMap<String, KeyResolverConfig>,

    /// Counter store backing the rate limiter.
    pub rate_limiter: RateLimiterStoreConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// How a route's `path` is compared with the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathMatch {
    /// Segment-aware prefix match (`/api` matches `/api` and `/api/v1`, not `/apiv1`).
    #[default]
    Prefix,
    /// The whole path must be equal.
    Exact,
}

/// Route configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Unique route identifier, also used to reference fallback routes.
    pub id: String,

    /// Host glob to match (`*` matches within one label), case-insensitive.
    #[serde(default)]
    pub host: Option<String>,

    /// Path to match.
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub path_match: PathMatch,

    /// Upstream target: `http://authority[/base]` or `static:`.
    pub uri: String,

    /// Fixed response served by `static:` routes.
    #[serde(default)]
    pub response: Option<StaticResponseConfig>,

    /// Filters applied in declaration order.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

/// Response returned by a `static:` route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticResponseConfig {
    #[serde(default = "default_static_status")]
    pub status: u16,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_static_status() -> u16 {
    200
}

/// A filter attached to a route.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    /// Append a header to the outbound request.
    AddRequestHeader { name: String, value: String },

    /// Token-bucket rate limit keyed by a resolved request identity.
    RateLimit {
        replenish_rate: u32,
        burst_capacity: u32,
        #[serde(default = "default_requested_tokens")]
        requested_tokens: u32,
        /// Name of an entry in `key_resolvers`. Absent means "client address".
        #[serde(default)]
        key_resolver: Option<String>,
    },

    /// Guard the upstream call with a circuit breaker.
    CircuitBreaker(CircuitBreakerConfig),
}

fn default_requested_tokens() -> u32 {
    1
}

/// Circuit breaker settings for one route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Breaker name for logs and metrics.
    pub name: String,

    /// Route id dispatched to when the breaker short-circuits or the call fails.
    #[serde(default)]
    pub fallback: Option<String>,

    /// Deadline for the upstream call, in milliseconds.
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time spent open before a trial call is let through, in milliseconds.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Concurrent trial calls allowed while half-open.
    #[serde(default = "default_one")]
    pub half_open_max_calls: u32,

    /// Successful trial calls required to close the circuit again.
    #[serde(default = "default_one")]
    pub success_threshold: u32,

    /// Count 5xx upstream responses as failures.
    #[serde(default)]
    pub fail_on_5xx: bool,
}

fn default_breaker_timeout_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    5000
}

fn default_one() -> u32 {
    1
}

impl CircuitBreakerConfig {
    /// Settings with defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fallback: None,
            timeout_ms: default_breaker_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_one(),
            success_threshold: default_one(),
            fail_on_5xx: false,
        }
    }
}

/// Where a key resolver reads the rate-limit identity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySourceKind {
    Constant,
    Header,
    Query,
    ClientIp,
}

/// Named key resolver definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyResolverConfig {
    pub kind: KeySourceKind,

    /// Header or query parameter name.
    #[serde(default)]
    pub name: Option<String>,

    /// Value returned by `constant` resolvers.
    #[serde(default)]
    pub value: Option<String>,

    /// Key used when the request does not carry the attribute.
    #[serde(default = "default_key")]
    pub default_key: String,
}

fn default_key() -> String {
    "anonymous".to_string()
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// What the rate limiter does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Let the request through and log a warning.
    #[default]
    FailOpen,
    /// Reject the request as rate limited.
    FailClosed,
}

/// Rate limiter counter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterStoreConfig {
    pub backend: StoreBackend,

    /// Redis URL (e.g., "redis://127.0.0.1:6379"), required for the redis backend.
    pub redis_url: Option<String>,

    /// Redis connection pool size.
    pub redis_max_connections: usize,

    /// Prefix of every bucket key.
    pub key_prefix: String,

    pub on_store_error: StoreFailurePolicy,

    /// Interval of the idle-bucket sweep for the memory backend, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimiterStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            redis_max_connections: 16,
            key_prefix: "request_rate_limiter".to_string(),
            on_store_error: StoreFailurePolicy::FailOpen,
            sweep_interval_secs: 60,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Whole-request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Request handling limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes the gateway will buffer.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}
