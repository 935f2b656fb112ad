//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, request ID)
//!     → routing::Router (filters, breaker, fallback)
//!     → client.rs (forward to upstream)
//!     → response.rs (errors mapped to status codes)
//!     → Send to client
//! ```

pub mod client;
pub mod request;
pub mod response;
pub mod server;

pub use client::{DispatchError, Dispatcher, HyperDispatcher};
pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use response::ProxyError;
pub use server::{HttpServer, StartupError};
