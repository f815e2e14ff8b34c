//! Idempotency keys mapping a client's retry token to the transaction it
//! created.

use crate::cache::error::CacheError;
use crate::clock::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("stored value for {key} is not a transaction id: {value}")]
    Corrupt { key: String, value: String },
}

/// Result of an atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyClaim {
    /// The key was free and now points at the supplied transaction.
    Claimed,
    /// The key already points at this transaction.
    Existing(Uuid),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Uuid>, IdempotencyError>;

    /// Atomically bind `key` to `transaction_id` unless a live binding
    /// exists. Concurrent callers with the same key see exactly one
    /// `Claimed`.
    async fn put_if_absent(
        &self,
        key: &str,
        transaction_id: Uuid,
    ) -> Result<IdempotencyClaim, IdempotencyError>;

    /// Drop a binding whose transaction never got written.
    async fn remove(&self, key: &str) -> Result<(), IdempotencyError>;

    async fn health_check(&self) -> Result<(), IdempotencyError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    transaction_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Single-process store. Expiry is judged against the injected clock, so
/// tests can step past the TTL without sleeping.
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, Binding>,
    ttl: Duration,
    clock: SharedClock,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Drop expired bindings, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, binding| binding.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed = removed, "purged expired idempotency keys");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<Uuid>, IdempotencyError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|binding| binding.expires_at > now)
            .map(|binding| binding.transaction_id))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        transaction_id: Uuid,
    ) -> Result<IdempotencyClaim, IdempotencyError> {
        let now = self.clock.now();
        let binding = Binding {
            transaction_id,
            expires_at: now + self.ttl,
        };

        // The entry guard holds the shard lock, making check-and-insert atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    Ok(IdempotencyClaim::Existing(occupied.get().transaction_id))
                } else {
                    occupied.insert(binding);
                    Ok(IdempotencyClaim::Claimed)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(binding);
                Ok(IdempotencyClaim::Claimed)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(feature = "cache")]
pub use redis_store::RedisIdempotencyStore;

#[cfg(feature = "cache")]
mod redis_store {
    use super::*;
    use crate::cache::RedisPool;

    const KEY_PREFIX: &str = "mmpay:idempotency:";

    /// Shared store for multi-instance deployments; `SET NX EX` gives the
    /// atomic claim and Redis handles expiry.
    pub struct RedisIdempotencyStore {
        pool: RedisPool,
        ttl_secs: u64,
    }

    impl RedisIdempotencyStore {
        pub fn new(pool: RedisPool, ttl_secs: u64) -> Self {
            Self { pool, ttl_secs }
        }

        fn redis_key(key: &str) -> String {
            format!("{}{}", KEY_PREFIX, key)
        }

        fn parse(key: &str, value: String) -> Result<Uuid, IdempotencyError> {
            Uuid::parse_str(&value).map_err(|_| IdempotencyError::Corrupt {
                key: key.to_string(),
                value,
            })
        }
    }

    #[async_trait]
    impl IdempotencyStore for RedisIdempotencyStore {
        async fn get(&self, key: &str) -> Result<Option<Uuid>, IdempotencyError> {
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;
            let value: Option<String> = redis::cmd("GET")
                .arg(Self::redis_key(key))
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::from)?;
            value.map(|v| Self::parse(key, v)).transpose()
        }

        async fn put_if_absent(
            &self,
            key: &str,
            transaction_id: Uuid,
        ) -> Result<IdempotencyClaim, IdempotencyError> {
            let redis_key = Self::redis_key(key);
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;

            // A binding can expire between SET and GET; one more round settles it.
            for _ in 0..2 {
                let set: Option<String> = redis::cmd("SET")
                    .arg(&redis_key)
                    .arg(transaction_id.to_string())
                    .arg("NX")
                    .arg("EX")
                    .arg(self.ttl_secs)
                    .query_async(&mut *conn)
                    .await
                    .map_err(CacheError::from)?;
                if set.is_some() {
                    return Ok(IdempotencyClaim::Claimed);
                }

                let existing: Option<String> = redis::cmd("GET")
                    .arg(&redis_key)
                    .query_async(&mut *conn)
                    .await
                    .map_err(CacheError::from)?;
                if let Some(value) = existing {
                    return Ok(IdempotencyClaim::Existing(Self::parse(key, value)?));
                }
            }

            Err(CacheError::OperationError(format!(
                "could not claim idempotency key {}",
                key
            ))
            .into())
        }

        async fn remove(&self, key: &str) -> Result<(), IdempotencyError> {
            let mut conn = self.pool.get().await.map_err(CacheError::from)?;
            let _: i64 = redis::cmd("DEL")
                .arg(Self::redis_key(key))
                .query_async(&mut *conn)
                .await
                .map_err(CacheError::from)?;
            Ok(())
        }

        async fn health_check(&self) -> Result<(), IdempotencyError> {
            crate::cache::health_check(&self.pool).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store(clock: &ManualClock) -> InMemoryIdempotencyStore {
        InMemoryIdempotencyStore::new(Duration::hours(24), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            store.put_if_absent("k1", first).await.unwrap(),
            IdempotencyClaim::Claimed
        );
        assert_eq!(
            store.put_if_absent("k1", second).await.unwrap(),
            IdempotencyClaim::Existing(first)
        );
        assert_eq!(store.get("k1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn bindings_expire_after_ttl() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let first = Uuid::new_v4();
        store.put_if_absent("k1", first).await.unwrap();

        clock.advance(Duration::hours(23));
        assert_eq!(store.get("k1").await.unwrap(), Some(first));

        clock.advance(Duration::hours(2));
        assert_eq!(store.get("k1").await.unwrap(), None);

        let next = Uuid::new_v4();
        assert_eq!(
            store.put_if_absent("k1", next).await.unwrap(),
            IdempotencyClaim::Claimed
        );
        assert_eq!(store.get("k1").await.unwrap(), Some(next));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let clock = ManualClock::default();
        let store = store(&clock);
        store.put_if_absent("old", Uuid::new_v4()).await.unwrap();
        clock.advance(Duration::hours(12));
        store.put_if_absent("new", Uuid::new_v4()).await.unwrap();
        clock.advance(Duration::hours(13));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_claims_produce_one_winner() {
        let clock = ManualClock::default();
        let store = Arc::new(store(&clock));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put_if_absent("shared", Uuid::new_v4()).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == IdempotencyClaim::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
