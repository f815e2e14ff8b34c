//! Idempotency store and its Redis plumbing.
//!
//! Without the `cache` feature, or without `REDIS_URL`, the in-memory store
//! is used and keys live only as long as the process.

pub mod error;
pub mod idempotency;

pub use error::{CacheError, CacheResult};
pub use idempotency::{
    IdempotencyClaim, IdempotencyError, IdempotencyStore, InMemoryIdempotencyStore,
};

#[cfg(feature = "cache")]
pub use idempotency::RedisIdempotencyStore;

use std::time::Duration;

#[cfg(feature = "cache")]
use bb8::Pool;
#[cfg(feature = "cache")]
use bb8_redis::RedisConnectionManager;
#[cfg(feature = "cache")]
use tracing::{error, info, warn};

#[cfg(feature = "cache")]
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 20,
            min_idle: 5,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// `None` when `REDIS_URL` is unset.
    pub fn from_env() -> Option<Self> {
        let redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty())?;
        let defaults = Self::default();
        Some(Self {
            redis_url,
            max_connections: std::env::var("REDIS_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        })
    }
}

/// Build the Redis pool. A failed initial PING is logged but not fatal.
#[cfg(feature = "cache")]
pub async fn init_cache_pool(config: &CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        "initializing redis pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!(error = %e, "failed to create redis connection manager");
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to build redis pool");
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = health_check(&pool).await {
        warn!(error = %e, "initial redis ping failed, continuing");
    }

    info!("redis pool initialized");
    Ok(pool)
}

#[cfg(feature = "cache")]
pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}
