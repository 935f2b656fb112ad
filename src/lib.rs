//! Traffic Gateway Library
//!
//! An HTTP API gateway core: ordered host/path routing, token-bucket rate
//! limiting over a pluggable counter store, and per-route circuit breakers
//! with fallback routes.
//!
//! ```text
//!     Client ──▶ http::server ──▶ routing::Router ──▶ routing::RouteTable
//!                                      │
//!                   ┌──────────────────┼───────────────────────┐
//!                   ▼                  ▼                       ▼
//!            AddHeader filter   security::RateLimiter   resilience::CircuitBreaker
//!                                      │                       │
//!                               security::store         http::client ──▶ Upstream
//!                              (memory | redis)                │
//!                                                        fallback route
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
