//! Security and traffic-control subsystem.
//!
//! # Data Flow
//! ```text
//! Rate-limit filter on a route:
//!     → key_resolver.rs (request attributes → bucket key)
//!     → rate_limit.rs (token bucket decision)
//!     → store/ (atomic refill-and-take: memory or Redis)
//!
//! Before forwarding:
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//! ```
//!
//! # Design Decisions
//! - Buckets are refilled lazily; no background timers per key
//! - Contention is per key, never global
//! - Store outages follow an explicit fail-open/fail-closed policy

pub mod headers;
pub mod key_resolver;
pub mod rate_limit;
pub mod store;

pub use key_resolver::{KeyResolver, KeyResolverRef, RequestIdentity};
pub use rate_limit::{RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use store::{CounterStore, MemoryStore, RedisStore, StoreError};
