//! Token-bucket rate limiting over a pluggable counter store.
//!
//! Buckets are refilled lazily on access; there is no background timer.
//! A fresh key starts with a full bucket.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::schema::StoreFailurePolicy;
use crate::observability::metrics;
use crate::security::store::{BucketOutcome, CounterStore};

/// Bucket parameters of one rate-limit filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub replenish_rate: u32,
    /// Bucket size, never below `replenish_rate`.
    pub burst_capacity: u32,
    /// Tokens taken per request.
    pub requested_tokens: u32,
}

impl RateLimiterConfig {
    pub fn new(replenish_rate: u32, burst_capacity: u32) -> Self {
        Self {
            replenish_rate,
            burst_capacity,
            requested_tokens: 1,
        }
    }

    pub fn with_requested_tokens(mut self, requested_tokens: u32) -> Self {
        self.requested_tokens = requested_tokens;
        self
    }
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: Instant,
}

/// Refill `state` up to `now` and try to take the requested tokens.
///
/// `None` is a bucket seen for the first time and starts full.
pub fn take_tokens(state: Option<BucketState>, now: Instant, limits: &RateLimiterConfig) -> (BucketState, BucketOutcome) {
    let capacity = limits.burst_capacity as f64;
    let requested = limits.requested_tokens as f64;

    let available = match state {
        None => capacity,
        Some(state) => {
            let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
            (state.tokens + elapsed * limits.replenish_rate as f64).min(capacity)
        }
    };

    let (tokens, permitted) = if available >= requested {
        (available - requested, true)
    } else {
        (available, false)
    };

    (
        BucketState {
            tokens,
            last_refill: now,
        },
        BucketOutcome { permitted, tokens },
    )
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    /// Request may proceed. `remaining` is -1 when the store could not be consulted.
    Permitted { remaining: f64 },
    /// Request is rejected. `retry_after` is `None` when no amount of waiting helps.
    Denied { retry_after: Option<Duration>, remaining: f64 },
}

impl RateLimitDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, RateLimitDecision::Permitted { .. })
    }
}

/// Token-bucket limiter shared by every route.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    failure_policy: StoreFailurePolicy,
    key_prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, failure_policy: StoreFailurePolicy, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            failure_policy,
            key_prefix: key_prefix.into(),
        }
    }

    /// Bucket name for a resolved key on a route.
    pub fn bucket_key(&self, route_id: &str, key: &str) -> String {
        format!("{}.{}.{}", self.key_prefix, route_id, key)
    }

    /// Check and consume tokens for `key`.
    pub async fn allow(&self, key: &str, limits: &RateLimiterConfig) -> RateLimitDecision {
        if limits.replenish_rate == 0 {
            return RateLimitDecision::Denied {
                retry_after: None,
                remaining: 0.0,
            };
        }

        match self.store.try_acquire(key, limits).await {
            Ok(BucketOutcome { permitted: true, tokens }) => RateLimitDecision::Permitted { remaining: tokens },
            Ok(BucketOutcome { permitted: false, tokens }) => {
                let missing = (limits.requested_tokens as f64 - tokens).max(0.0);
                RateLimitDecision::Denied {
                    retry_after: Some(Duration::from_secs_f64(missing / limits.replenish_rate as f64)),
                    remaining: tokens,
                }
            }
            Err(e) => {
                metrics::record_store_error(self.failure_policy);
                match self.failure_policy {
                    StoreFailurePolicy::FailOpen => {
                        tracing::warn!(key = %key, error = %e, policy = "fail_open", "Rate limit store unavailable, permitting request");
                        RateLimitDecision::Permitted { remaining: -1.0 }
                    }
                    StoreFailurePolicy::FailClosed => {
                        tracing::warn!(key = %key, error = %e, policy = "fail_closed", "Rate limit store unavailable, denying request");
                        RateLimitDecision::Denied {
                            retry_after: Some(Duration::from_secs(1)),
                            remaining: 0.0,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::store::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn limiter(policy: StoreFailurePolicy) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), policy, "test")
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn try_acquire(&self, _key: &str, _limits: &RateLimiterConfig) -> Result<BucketOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_take_tokens_first_access_starts_full() {
        let limits = RateLimiterConfig::new(1, 5);
        let now = Instant::now();
        let (state, outcome) = take_tokens(None, now, &limits);
        assert!(outcome.permitted);
        assert_eq!(state.tokens, 4.0);
        assert_eq!(state.last_refill, now);
    }

    #[test]
    fn test_take_tokens_refill_caps_at_capacity() {
        let limits = RateLimiterConfig::new(10, 20);
        let start = Instant::now();
        let state = BucketState {
            tokens: 0.0,
            last_refill: start,
        };
        let (state, outcome) = take_tokens(Some(state), start + Duration::from_secs(60), &limits);
        assert!(outcome.permitted);
        assert_eq!(state.tokens, 19.0);
    }

    #[test]
    fn test_take_tokens_denial_keeps_refilled_tokens() {
        let limits = RateLimiterConfig::new(2, 4).with_requested_tokens(3);
        let start = Instant::now();
        let state = BucketState {
            tokens: 0.0,
            last_refill: start,
        };
        let (state, outcome) = take_tokens(Some(state), start + Duration::from_millis(500), &limits);
        assert!(!outcome.permitted);
        assert_eq!(state.tokens, 1.0);
        assert_eq!(state.last_refill, start + Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_per_second() {
        let limiter = limiter(StoreFailurePolicy::FailOpen);
        let limits = RateLimiterConfig::new(1, 1);

        assert!(limiter.allow("k", &limits).await.is_permitted());
        for _ in 0..2 {
            match limiter.allow("k", &limits).await {
                RateLimitDecision::Denied { retry_after, .. } => {
                    let retry_after = retry_after.unwrap();
                    assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(1));
                }
                other => panic!("expected denial, got {:?}", other),
            }
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("k", &limits).await.is_permitted());
        assert!(!limiter.allow("k", &limits).await.is_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(StoreFailurePolicy::FailOpen);
        let limits = RateLimiterConfig::new(1, 1);

        assert!(limiter.allow("a", &limits).await.is_permitted());
        assert!(limiter.allow("b", &limits).await.is_permitted());
        assert!(!limiter.allow("a", &limits).await.is_permitted());
    }

    #[tokio::test]
    async fn test_zero_rate_denies_everything() {
        let limiter = limiter(StoreFailurePolicy::FailOpen);
        let limits = RateLimiterConfig::new(0, 10);
        assert_eq!(
            limiter.allow("k", &limits).await,
            RateLimitDecision::Denied {
                retry_after: None,
                remaining: 0.0
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_overspend() {
        let limiter = Arc::new(limiter(StoreFailurePolicy::FailOpen));
        // Slow refill so no tokens come back while the test runs.
        let limits = RateLimiterConfig::new(1, 25);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            tasks.spawn(async move { limiter.allow("shared", &limits).await.is_permitted() });
        }

        let mut permitted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                permitted += 1;
            }
        }
        assert_eq!(permitted, 25);
    }

    #[tokio::test]
    async fn test_store_failure_policies() {
        let limits = RateLimiterConfig::new(1, 1);

        let open = RateLimiter::new(Arc::new(BrokenStore), StoreFailurePolicy::FailOpen, "test");
        assert_eq!(open.allow("k", &limits).await, RateLimitDecision::Permitted { remaining: -1.0 });

        let closed = RateLimiter::new(Arc::new(BrokenStore), StoreFailurePolicy::FailClosed, "test");
        assert!(matches!(
            closed.allow("k", &limits).await,
            RateLimitDecision::Denied { retry_after: Some(_), .. }
        ));
    }

    #[test]
    fn test_bucket_key() {
        let limiter = limiter(StoreFailurePolicy::FailOpen);
        assert_eq!(limiter.bucket_key("throttle", "alice"), "test.throttle.alice");
    }
}
