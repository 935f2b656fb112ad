//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path, headers)
//!     → router.rs (orchestration)
//!     → table.rs (ordered lookup)
//!     → matcher.rs (evaluate host glob / path predicates)
//!     → filter.rs (header injection, rate limit, breaker guard)
//!     → Return: upstream, fallback or error response
//!
//! Route Compilation (startup and reload):
//!     RouteConfig[]
//!     → Compile matchers and filters
//!     → Freeze as immutable RouteTable
//!     → Router::publish swaps it in atomically
//! ```
//!
//! # Design Decisions
//! - Routes compiled once, immutable at runtime
//! - No regex in hot path
//! - Deterministic: same input always matches same route
//! - First match wins (registration order)

pub mod filter;
pub mod matcher;
pub mod router;
pub mod table;

pub use filter::FilterSpec;
pub use router::Router;
pub use table::{Route, RouteNotFound, RouteTable, RouteTableError, Upstream};
