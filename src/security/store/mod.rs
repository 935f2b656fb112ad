//! Counter stores backing the rate limiter.
//!
//! # Contract
//! - `try_acquire` is one atomic read-modify-write per call: refill the
//!   bucket, take the requested tokens if available, persist the result
//! - Concurrent calls on the same key never spend more than the bucket holds
//! - Failures to reach the backend surface as [`StoreError`]; the limiter
//!   applies the configured fail-open/fail-closed policy

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::security::rate_limit::RateLimiterConfig;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Result of one bucket access.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the requested tokens were taken.
    pub permitted: bool,
    /// Tokens left in the bucket after this access.
    pub tokens: f64,
}

/// Counter store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store returned an unexpected reply: {0}")]
    Protocol(String),
}

/// A key-value backend holding token buckets.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Refill the bucket named `key` and try to take `limits.requested_tokens`.
    async fn try_acquire(&self, key: &str, limits: &RateLimiterConfig) -> Result<BucketOutcome, StoreError>;
}
