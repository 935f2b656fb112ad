//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::security::rate_limit::{take_tokens, BucketState, RateLimiterConfig};
use crate::security::store::{BucketOutcome, CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: BucketState,
    /// When the bucket will be back at capacity, i.e. indistinguishable from a fresh one.
    full_at: Instant,
}

/// Token buckets in a sharded map.
///
/// Each access runs under the shard's write lock, which makes the
/// read-modify-write atomic per key without serializing unrelated keys.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that have refilled completely. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, slot| slot.full_at > now);
        before.saturating_sub(self.buckets.len())
    }

    /// Periodically evict idle buckets until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_idle();
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = self.len(), "Evicted idle rate limit buckets");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn try_acquire(&self, key: &str, limits: &RateLimiterConfig) -> Result<BucketOutcome, StoreError> {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Slot {
            state: BucketState {
                tokens: limits.burst_capacity as f64,
                last_refill: now,
            },
            full_at: now,
        });

        let (state, outcome) = take_tokens(Some(entry.state), now, limits);
        let missing = (limits.burst_capacity as f64 - state.tokens).max(0.0);
        let full_at = if missing == 0.0 {
            now
        } else {
            now + Duration::from_secs_f64(missing / limits.replenish_rate.max(1) as f64)
        };
        *entry = Slot { state, full_at };

        Ok(outcome)
    }
}
