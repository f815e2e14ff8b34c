//! User wallet balances held by this service, in minor units per currency.
//!
//! Withdrawals place a hold by debiting up front; a failed withdrawal
//! credits the hold back.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("insufficient balance: available {available}, requested {requested}")]
    Insufficient { available: i64, requested: i64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("balance store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn available(&self, user_id: &str, currency: &str) -> Result<i64, BalanceError>;

    /// Take `amount` off the balance, failing without change if it would go
    /// negative. Returns the new balance.
    async fn debit(&self, user_id: &str, currency: &str, amount: i64)
        -> Result<i64, BalanceError>;

    async fn credit(&self, user_id: &str, currency: &str, amount: i64)
        -> Result<i64, BalanceError>;
}

#[derive(Default)]
pub struct InMemoryBalanceStore {
    balances: DashMap<(String, String), i64>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, currency: &str) -> (String, String) {
        (user_id.to_string(), currency.to_uppercase())
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn available(&self, user_id: &str, currency: &str) -> Result<i64, BalanceError> {
        Ok(self
            .balances
            .get(&Self::key(user_id, currency))
            .map(|b| *b)
            .unwrap_or(0))
    }

    async fn debit(
        &self,
        user_id: &str,
        currency: &str,
        amount: i64,
    ) -> Result<i64, BalanceError> {
        if amount <= 0 {
            return Err(BalanceError::InvalidAmount(amount));
        }
        let mut balance = self.balances.entry(Self::key(user_id, currency)).or_insert(0);
        if *balance < amount {
            return Err(BalanceError::Insufficient {
                available: *balance,
                requested: amount,
            });
        }
        *balance -= amount;
        debug!(user_id = user_id, currency = currency, amount = amount, "balance debited");
        Ok(*balance)
    }

    async fn credit(
        &self,
        user_id: &str,
        currency: &str,
        amount: i64,
    ) -> Result<i64, BalanceError> {
        if amount <= 0 {
            return Err(BalanceError::InvalidAmount(amount));
        }
        let mut balance = self.balances.entry(Self::key(user_id, currency)).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| BalanceError::Store("balance overflow".to_string()))?;
        debug!(user_id = user_id, currency = currency, amount = amount, "balance credited");
        Ok(*balance)
    }
}

#[cfg(feature = "database")]
pub use postgres::PostgresBalanceStore;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use sqlx::PgPool;

    /// Balances in `user_balances`. The debit is one conditional UPDATE, so
    /// concurrent holds never take the row below zero.
    pub struct PostgresBalanceStore {
        pool: PgPool,
    }

    impl PostgresBalanceStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    fn store_error(e: sqlx::Error) -> BalanceError {
        BalanceError::Store(e.to_string())
    }

    #[async_trait]
    impl BalanceStore for PostgresBalanceStore {
        async fn available(&self, user_id: &str, currency: &str) -> Result<i64, BalanceError> {
            let balance = sqlx::query_scalar::<_, i64>(
                "SELECT available FROM user_balances WHERE user_id = $1 AND currency = $2",
            )
            .bind(user_id)
            .bind(currency.to_uppercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
            Ok(balance.unwrap_or(0))
        }

        async fn debit(
            &self,
            user_id: &str,
            currency: &str,
            amount: i64,
        ) -> Result<i64, BalanceError> {
            if amount <= 0 {
                return Err(BalanceError::InvalidAmount(amount));
            }
            let remaining = sqlx::query_scalar::<_, i64>(
                "UPDATE user_balances SET available = available - $3, updated_at = NOW() \
                 WHERE user_id = $1 AND currency = $2 AND available >= $3 \
                 RETURNING available",
            )
            .bind(user_id)
            .bind(currency.to_uppercase())
            .bind(amount)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

            match remaining {
                Some(remaining) => {
                    debug!(user_id = user_id, currency = currency, amount = amount, "balance debited");
                    Ok(remaining)
                }
                None => Err(BalanceError::Insufficient {
                    available: self.available(user_id, currency).await?,
                    requested: amount,
                }),
            }
        }

        async fn credit(
            &self,
            user_id: &str,
            currency: &str,
            amount: i64,
        ) -> Result<i64, BalanceError> {
            if amount <= 0 {
                return Err(BalanceError::InvalidAmount(amount));
            }
            let balance = sqlx::query_scalar::<_, i64>(
                "INSERT INTO user_balances (user_id, currency, available) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id, currency) DO UPDATE \
                 SET available = user_balances.available + EXCLUDED.available, updated_at = NOW() \
                 RETURNING available",
            )
            .bind(user_id)
            .bind(currency.to_uppercase())
            .bind(amount)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
            debug!(user_id = user_id, currency = currency, amount = amount, "balance credited");
            Ok(balance)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debit_never_overdraws() {
        let store = InMemoryBalanceStore::new();
        store.credit("u1", "MMK", 5000).await.unwrap();

        assert_eq!(store.debit("u1", "mmk", 3000).await.unwrap(), 2000);
        assert_eq!(
            store.debit("u1", "MMK", 3000).await.unwrap_err(),
            BalanceError::Insufficient {
                available: 2000,
                requested: 3000
            }
        );
        assert_eq!(store.available("u1", "MMK").await.unwrap(), 2000);
    }

    #[tokio::test]
    async fn balances_are_per_currency() {
        let store = InMemoryBalanceStore::new();
        store.credit("u1", "MMK", 100).await.unwrap();
        assert_eq!(store.available("u1", "USD").await.unwrap(), 0);
        assert!(store.debit("u1", "MMK", 0).await.is_err());
    }
}
