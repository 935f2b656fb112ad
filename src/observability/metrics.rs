//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, throttling, breaker state)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by route, status
//! - `gateway_request_duration_seconds` (histogram): latency by route
//! - `gateway_rate_limited_total` (counter): 429s by route
//! - `gateway_rate_limit_store_errors_total` (counter): store failures by policy
//! - `gateway_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `gateway_fallbacks_total` (counter): fallback dispatches by route, reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps tests free of globals
//! - Unmatched requests are labelled `route="none"`

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::time::Instant;

use crate::config::schema::StoreFailurePolicy;
use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(route: &str, status: u16, start: Instant) {
    metrics::counter!(
        "gateway_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_rate_limited(route: &str) {
    metrics::counter!("gateway_rate_limited_total", "route" => route.to_string()).increment(1);
}

pub fn record_store_error(policy: StoreFailurePolicy) {
    let policy = match policy {
        StoreFailurePolicy::FailOpen => "fail_open",
        StoreFailurePolicy::FailClosed => "fail_closed",
    };
    metrics::counter!("gateway_rate_limit_store_errors_total", "policy" => policy).increment(1);
}

pub fn record_circuit_state(route: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
        CircuitState::HalfOpen => 2.0,
    };
    metrics::gauge!("gateway_circuit_state", "route" => route.to_string()).set(value);
}

/// `reason` is one of `open`, `timeout`, `error`.
pub fn record_fallback(route: &str, reason: &'static str) {
    metrics::counter!(
        "gateway_fallbacks_total",
        "route" => route.to_string(),
        "reason" => reason
    )
    .increment(1);
}
