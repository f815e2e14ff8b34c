use crate::database::error::DatabaseError;
use crate::payments::types::{ProviderName, RecipientInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodStatus {
    Pending,
    Verified,
}

impl PaymentMethodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodStatus::Pending => "pending",
            PaymentMethodStatus::Verified => "verified",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodType {
    Wallet,
    BankAccount,
}

impl PaymentMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodType::Wallet => "wallet",
            PaymentMethodType::BankAccount => "bank_account",
        }
    }
}

/// A user's saved payout destination.
///
/// Never deleted: deactivated methods stay around so historical
/// withdrawals keep pointing at something.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: String,
    pub provider: ProviderName,
    pub method_type: PaymentMethodType,
    pub destination: RecipientInfo,
    pub status: PaymentMethodStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentMethod {
    pub fn new(
        user_id: impl Into<String>,
        provider: ProviderName,
        method_type: PaymentMethodType,
        destination: RecipientInfo,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            provider,
            method_type,
            destination,
            status: PaymentMethodStatus::Pending,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` may withdraw to this method right now.
    pub fn usable_by(&self, user_id: &str) -> bool {
        self.user_id == user_id && self.is_active && self.status == PaymentMethodStatus::Verified
    }
}

#[async_trait]
pub trait PaymentMethodStore: Send + Sync {
    async fn create(&self, method: &PaymentMethod) -> Result<(), DatabaseError>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentMethod>, DatabaseError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PaymentMethod>, DatabaseError>;

    async fn mark_verified(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError>;

    async fn deactivate(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError>;
}

#[derive(Default)]
pub struct InMemoryPaymentMethodStore {
    methods: RwLock<HashMap<Uuid, PaymentMethod>>,
}

impl InMemoryPaymentMethodStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn modify(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut PaymentMethod),
    ) -> Result<PaymentMethod, DatabaseError> {
        let mut methods = self.methods.write().await;
        let method = methods
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("payment_method", id))?;
        apply(method);
        method.updated_at = Utc::now();
        Ok(method.clone())
    }
}

#[async_trait]
impl PaymentMethodStore for InMemoryPaymentMethodStore {
    async fn create(&self, method: &PaymentMethod) -> Result<(), DatabaseError> {
        self.methods.write().await.insert(method.id, method.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentMethod>, DatabaseError> {
        Ok(self.methods.read().await.get(&id).cloned())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PaymentMethod>, DatabaseError> {
        let mut found: Vec<PaymentMethod> = self
            .methods
            .read()
            .await
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn mark_verified(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError> {
        self.modify(id, |m| m.status = PaymentMethodStatus::Verified)
            .await
    }

    async fn deactivate(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError> {
        self.modify(id, |m| m.is_active = false).await
    }
}

#[cfg(feature = "database")]
pub use postgres::PostgresPaymentMethodStore;

#[cfg(feature = "database")]
mod postgres {
    use super::*;
    use crate::database::error::DatabaseErrorKind;
    use sqlx::{FromRow, PgPool};
    use std::str::FromStr;

    const COLUMNS: &str = "id, user_id, provider, method_type, phone_number, account_number, \
         account_name, status, is_active, created_at, updated_at";

    #[derive(Debug, FromRow)]
    struct PaymentMethodRow {
        id: Uuid,
        user_id: String,
        provider: String,
        method_type: String,
        phone_number: Option<String>,
        account_number: Option<String>,
        account_name: Option<String>,
        status: String,
        is_active: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<PaymentMethodRow> for PaymentMethod {
        type Error = DatabaseError;

        fn try_from(row: PaymentMethodRow) -> Result<Self, Self::Error> {
            let provider = ProviderName::from_str(&row.provider).map_err(|e| {
                DatabaseError::new(DatabaseErrorKind::Unknown {
                    message: e.to_string(),
                })
            })?;
            Ok(PaymentMethod {
                id: row.id,
                user_id: row.user_id,
                provider,
                method_type: match row.method_type.as_str() {
                    "bank_account" => PaymentMethodType::BankAccount,
                    _ => PaymentMethodType::Wallet,
                },
                destination: RecipientInfo {
                    phone_number: row.phone_number,
                    account_number: row.account_number,
                    account_name: row.account_name,
                },
                status: match row.status.as_str() {
                    "verified" => PaymentMethodStatus::Verified,
                    _ => PaymentMethodStatus::Pending,
                },
                is_active: row.is_active,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        }
    }

    pub struct PostgresPaymentMethodStore {
        pool: PgPool,
    }

    impl PostgresPaymentMethodStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn update_returning(
            &self,
            id: Uuid,
            set_clause: &str,
        ) -> Result<PaymentMethod, DatabaseError> {
            sqlx::query_as::<_, PaymentMethodRow>(&format!(
                "UPDATE payment_methods SET {}, updated_at = NOW() WHERE id = $1 RETURNING {}",
                set_clause, COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or_else(|| DatabaseError::not_found("payment_method", id))
            .and_then(PaymentMethod::try_from)
        }
    }

    #[async_trait]
    impl PaymentMethodStore for PostgresPaymentMethodStore {
        async fn create(&self, method: &PaymentMethod) -> Result<(), DatabaseError> {
            sqlx::query(&format!(
                "INSERT INTO payment_methods ({}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                COLUMNS
            ))
            .bind(method.id)
            .bind(&method.user_id)
            .bind(method.provider.as_str())
            .bind(method.method_type.as_str())
            .bind(&method.destination.phone_number)
            .bind(&method.destination.account_number)
            .bind(&method.destination.account_name)
            .bind(method.status.as_str())
            .bind(method.is_active)
            .bind(method.created_at)
            .bind(method.updated_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn get(&self, id: Uuid) -> Result<Option<PaymentMethod>, DatabaseError> {
            sqlx::query_as::<_, PaymentMethodRow>(&format!(
                "SELECT {} FROM payment_methods WHERE id = $1",
                COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(PaymentMethod::try_from)
            .transpose()
        }

        async fn list_by_user(&self, user_id: &str) -> Result<Vec<PaymentMethod>, DatabaseError> {
            sqlx::query_as::<_, PaymentMethodRow>(&format!(
                "SELECT {} FROM payment_methods WHERE user_id = $1 ORDER BY created_at DESC",
                COLUMNS
            ))
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(PaymentMethod::try_from)
            .collect()
        }

        async fn mark_verified(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError> {
            self.update_returning(id, "status = 'verified'").await
        }

        async fn deactivate(&self, id: Uuid) -> Result<PaymentMethod, DatabaseError> {
            self.update_returning(id, "is_active = false").await
        }
    }
}
