//! Redis-backed counter store.
//!
//! Every access is a single Lua script execution, so the refill, the token
//! take, and the write-back happen atomically on the server. The bucket hash
//! expires after twice its fill time.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, PoolConfig, Runtime};
use redis::Script;

use crate::security::rate_limit::RateLimiterConfig;
use crate::security::store::{BucketOutcome, CounterStore, StoreError};

const TOKEN_BUCKET_SCRIPT: &str = include_str!("../../../scripts/token_bucket.lua");

/// Token buckets kept in Redis.
pub struct RedisStore {
    pool: Pool,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool.status())
            .finish()
    }
}

impl RedisStore {
    /// Create the connection pool. Connections are opened lazily.
    pub fn new(url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let mut cfg = DeadpoolRedisConfig::from_url(url);
        cfg.pool = Some(PoolConfig::new(max_connections));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(format!("pool creation failed: {}", e)))?;

        tracing::info!(max_connections, "Redis rate limit store configured");
        Ok(Self {
            pool,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Round-trip a PING to verify connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }
}

fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn try_acquire(&self, key: &str, limits: &RateLimiterConfig) -> Result<BucketOutcome, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let (allowed, tokens): (i64, String) = self
            .script
            .key(key)
            .arg(limits.replenish_rate)
            .arg(limits.burst_capacity)
            .arg(format!("{:.6}", unix_now_secs()))
            .arg(limits.requested_tokens)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    StoreError::Unavailable(e.to_string())
                } else {
                    StoreError::Protocol(e.to_string())
                }
            })?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| StoreError::Protocol(format!("bad token count '{}': {}", tokens, e)))?;

        Ok(BucketOutcome {
            permitted: allowed == 1,
            tokens,
        })
    }
}
