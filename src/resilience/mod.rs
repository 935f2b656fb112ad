//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request on a guarded route:
//!     → circuit_breaker.rs (admit, or short-circuit to the fallback)
//!     → timeouts.rs (bound the upstream call by the route deadline)
//!     → circuit_breaker.rs (record success or failure)
//! ```
//!
//! # Design Decisions
//! - Timeouts count as failures
//! - One breaker per route; routes never share failure state
//! - Breakers survive config reloads when their settings are unchanged

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{BreakerError, CallPermit, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use timeouts::{with_deadline, DeadlineExceeded};
