//! Payment Orchestrator Service
//!
//! Creates deposits and withdrawals against the configured wallet adapters,
//! drives every transaction through its state machine, and applies provider
//! outcomes (webhooks and reconciliation polls) to the ledger.
//!
//! Every ledger write is a compare-and-set on the record's `version`, so
//! concurrent writers (a webhook racing the dispatch that created the order,
//! reconciliation racing a webhook) never lose each other's audit entries or
//! apply a transition twice.

use crate::cache::idempotency::{IdempotencyClaim, IdempotencyError, IdempotencyStore};
use crate::clock::{SharedClock, SystemClock};
use crate::database::error::DatabaseError;
use crate::database::payment_method_repository::{InMemoryPaymentMethodStore, PaymentMethodStore};
use crate::database::transaction::{
    Attempt, NewTransaction, Transaction, TransactionKind, TransactionState, TransitionError,
    DISPATCH_ACTION,
};
use crate::database::transaction_repository::TransactionLedger;
use crate::logging::mask_phone;
use crate::error::{
    AppError, AppErrorKind, DomainError, ExternalError, InfrastructureError, ValidationError,
};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::Provider;
use crate::payments::registry::ProviderRegistry;
use crate::payments::retry::{RetryOutcome, RetryPolicy};
use crate::payments::types::{
    DepositRequest, PayAction, ProviderName, ProviderStatus, RecipientInfo, StatusResponse,
    WebhookEvent, WithdrawalRequest,
};
use crate::services::balance::{BalanceError, BalanceStore, InMemoryBalanceStore};
use crate::services::notification::{
    TransactionEvent, TransactionEventProducer, TransactionEventType,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Failure reasons stored on transactions.
pub mod reasons {
    pub const INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
    pub const PAYMENT_METHOD_NOT_VERIFIED: &str = "PAYMENT_METHOD_NOT_VERIFIED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const RECONCILIATION_TIMEOUT: &str = "RECONCILIATION_TIMEOUT";
    pub const PROVIDER_FAILED: &str = "PROVIDER_FAILED";
    pub const BALANCE_UNAVAILABLE: &str = "BALANCE_UNAVAILABLE";
}

const MAX_WRITE_ATTEMPTS: usize = 5;
const IDEMPOTENCY_LOOKUP_ATTEMPTS: usize = 10;
const IDEMPOTENCY_LOOKUP_DELAY: Duration = Duration::from_millis(50);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Currencies accepted for new transactions (upper-case ISO codes)
    pub supported_currencies: Vec<String>,
    pub max_retry_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub idempotency_key_ttl_secs: u64,
    /// Smallest accepted amount in minor units
    pub min_amount: i64,
    pub max_amount: Option<i64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            supported_currencies: vec!["MMK".to_string()],
            max_retry_attempts: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 4000,
            idempotency_key_ttl_secs: 86400,
            min_amount: 1,
            max_amount: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            supported_currencies: std::env::var("SUPPORTED_CURRENCIES")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|c| c.trim().to_uppercase())
                        .filter(|c| !c.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.supported_currencies),
            max_retry_attempts: std::env::var("MAX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retry_attempts),
            initial_retry_delay_ms: std::env::var("INITIAL_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.initial_retry_delay_ms),
            max_retry_delay_ms: std::env::var("MAX_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retry_delay_ms),
            idempotency_key_ttl_secs: std::env::var("IDEMPOTENCY_KEY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.idempotency_key_ttl_secs),
            min_amount: std::env::var("MIN_AMOUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_amount),
            max_amount: std::env::var("MAX_AMOUNT")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retry_attempts,
            Duration::from_millis(self.initial_retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }
}

// ============================================================================
// Requests & Errors
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDepositRequest {
    pub user_id: String,
    pub provider: ProviderName,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    /// Payer wallet, required by push-payment providers
    #[serde(default)]
    pub recipient: RecipientInfo,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWithdrawalRequest {
    pub user_id: String,
    pub provider: ProviderName,
    pub amount: i64,
    pub currency: String,
    pub payment_method_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// What applying a provider outcome did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Applied,
    /// The same event id is already in the audit trail.
    Duplicate,
    /// The transaction had already reached a terminal state.
    AlreadyTerminal,
    /// Recorded, no state change (provider still pending, amount mismatch).
    Recorded,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: String },

    #[error("no adapter configured for provider {provider}")]
    ProviderUnavailable { provider: ProviderName },

    #[error("idempotency key {key} is still being processed")]
    IdempotencyInFlight { key: String },

    #[error("transaction {transaction_id} is waiting on the provider")]
    DispatchInFlight { transaction_id: Uuid },

    #[error("transaction {transaction_id}: {source}")]
    InvalidTransition {
        transaction_id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: i64, required: i64 },

    #[error("provider call failed: {0}")]
    Provider(#[from] PaymentError),

    #[error("ledger error: {0}")]
    Ledger(#[from] DatabaseError),

    #[error("idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("balance store error: {0}")]
    Balance(String),

    #[error("transaction {transaction_id} kept changing underneath the update")]
    WriteContention { transaction_id: Uuid },

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match &err {
            OrchestratorError::Validation { field, message } => match field.as_str() {
                "amount" => AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: String::new(),
                    reason: message.clone(),
                }),
                "currency" => AppErrorKind::Validation(ValidationError::InvalidCurrency {
                    currency: String::new(),
                    reason: message.clone(),
                }),
                "provider" => AppErrorKind::Validation(ValidationError::InvalidProvider {
                    provider: String::new(),
                    reason: message.clone(),
                }),
                _ => AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone(),
                    reason: message.clone(),
                }),
            },
            OrchestratorError::TransactionNotFound { transaction_id } => {
                AppErrorKind::Domain(DomainError::TransactionNotFound {
                    transaction_id: transaction_id.clone(),
                })
            }
            OrchestratorError::ProviderUnavailable { provider } => {
                AppErrorKind::External(ExternalError::ProviderUnavailable {
                    provider: provider.to_string(),
                })
            }
            OrchestratorError::IdempotencyInFlight { key } => {
                AppErrorKind::Domain(DomainError::IdempotencyKeyInProgress { key: key.clone() })
            }
            OrchestratorError::DispatchInFlight { transaction_id } => {
                AppErrorKind::Domain(DomainError::DispatchInFlight {
                    transaction_id: transaction_id.to_string(),
                })
            }
            OrchestratorError::InvalidTransition {
                transaction_id,
                source,
            } => AppErrorKind::Domain(DomainError::InvalidStateTransition {
                transaction_id: transaction_id.to_string(),
                from: source.from.to_string(),
                to: source.to.to_string(),
            }),
            OrchestratorError::InsufficientBalance {
                available,
                required,
            } => AppErrorKind::Domain(DomainError::InsufficientBalance {
                available: *available,
                required: *required,
            }),
            OrchestratorError::Provider(e) => return AppError::from(e.clone()),
            OrchestratorError::Ledger(e) => return AppError::from(e.clone()),
            OrchestratorError::Idempotency(_) => {
                AppErrorKind::Infrastructure(InfrastructureError::Cache {
                    message: err.to_string(),
                })
            }
            OrchestratorError::Balance(_) => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: err.to_string(),
                    is_retryable: true,
                })
            }
            OrchestratorError::WriteContention { .. } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: err.to_string(),
                    is_retryable: true,
                })
            }
            OrchestratorError::Internal(_) => {
                AppErrorKind::Infrastructure(InfrastructureError::Internal {
                    message: err.to_string(),
                })
            }
        };
        AppError::new(kind)
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

/// Cheap to clone; clones share every store and lock table.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    registry: ProviderRegistry,
    ledger: Arc<dyn TransactionLedger>,
    idempotency: Arc<dyn IdempotencyStore>,
    balances: Arc<dyn BalanceStore>,
    payment_methods: Arc<dyn PaymentMethodStore>,
    events: Option<TransactionEventProducer>,
    clock: SharedClock,
    config: Arc<OrchestratorConfig>,
    retry: RetryPolicy,
    user_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        ledger: Arc<dyn TransactionLedger>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            registry,
            ledger,
            idempotency,
            balances: Arc::new(InMemoryBalanceStore::new()),
            payment_methods: Arc::new(InMemoryPaymentMethodStore::new()),
            events: None,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
            retry,
            user_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_balances(mut self, balances: Arc<dyn BalanceStore>) -> Self {
        self.balances = balances;
        self
    }

    pub fn with_payment_methods(mut self, payment_methods: Arc<dyn PaymentMethodStore>) -> Self {
        self.payment_methods = payment_methods;
        self
    }

    pub fn with_events(mut self, events: TransactionEventProducer) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn TransactionLedger> {
        &self.ledger
    }

    pub fn idempotency_store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.idempotency
    }

    pub fn balances(&self) -> &Arc<dyn BalanceStore> {
        &self.balances
    }

    pub fn payment_methods(&self) -> &Arc<dyn PaymentMethodStore> {
        &self.payment_methods
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a deposit and ask the provider for a pay action.
    ///
    /// Returns the record in `processing` (provider accepted) or `failed`
    /// (rejected or retries exhausted); never `completed`. A repeated
    /// idempotency key returns the original record without calling the
    /// provider again.
    pub async fn create_deposit(
        &self,
        request: CreateDepositRequest,
    ) -> OrchestratorResult<Transaction> {
        let scoped_key = request
            .idempotency_key
            .as_deref()
            .map(|key| Self::scoped_key(&request.user_id, key));
        if let Some(existing) = self.replay(scoped_key.as_deref()).await? {
            return Ok(existing);
        }

        self.validate(request.provider, request.amount, &request.currency)
            .await?;

        let tx = Transaction::new(
            NewTransaction {
                kind: TransactionKind::Deposit,
                provider: request.provider,
                user_id: request.user_id,
                amount: request.amount,
                currency: request.currency,
                recipient: request.recipient,
                payment_method_id: None,
                idempotency_key: request.idempotency_key,
                parent_transaction_id: None,
            },
            self.clock.now(),
        );
        let description = request.description;

        // From here the work runs detached: a caller that goes away no longer
        // stops it, and the ledger always gets the outcome.
        let this = self.clone();
        tokio::spawn(async move {
            match this.claim_and_insert(tx, scoped_key).await? {
                Claimed::Existing(existing) => Ok(existing),
                Claimed::Inserted(tx) => this.dispatch_deposit(tx, description).await,
            }
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("deposit task failed: {}", e)))?
    }

    /// Create a withdrawal to one of the user's saved payment methods.
    ///
    /// The balance check and hold run under a per-user lock; a record that
    /// fails either check is returned in `rejected` with the reason.
    pub async fn create_withdrawal(
        &self,
        request: CreateWithdrawalRequest,
    ) -> OrchestratorResult<Transaction> {
        let scoped_key = request
            .idempotency_key
            .as_deref()
            .map(|key| Self::scoped_key(&request.user_id, key));
        if let Some(existing) = self.replay(scoped_key.as_deref()).await? {
            return Ok(existing);
        }

        self.validate(request.provider, request.amount, &request.currency)
            .await?;

        let method = self.payment_methods.get(request.payment_method_id).await?;
        let recipient = method
            .as_ref()
            .map(|m| m.destination.clone())
            .unwrap_or_default();
        let method_usable = method
            .as_ref()
            .map(|m| m.usable_by(&request.user_id) && m.provider == request.provider)
            .unwrap_or(false);

        let tx = Transaction::new(
            NewTransaction {
                kind: TransactionKind::Withdrawal,
                provider: request.provider,
                user_id: request.user_id,
                amount: request.amount,
                currency: request.currency,
                recipient,
                payment_method_id: Some(request.payment_method_id),
                idempotency_key: request.idempotency_key,
                parent_transaction_id: None,
            },
            self.clock.now(),
        );
        let reason = request.reason;

        let this = self.clone();
        tokio::spawn(async move {
            let tx = match this.claim_and_insert(tx, scoped_key).await? {
                Claimed::Existing(existing) => return Ok(existing),
                Claimed::Inserted(tx) => tx,
            };
            if !method_usable {
                return this
                    .reject(tx.id, reasons::PAYMENT_METHOD_NOT_VERIFIED)
                    .await;
            }
            let approved = match this.approve_withdrawal(tx).await? {
                Approval::Approved(tx) => tx,
                Approval::Rejected(tx) => return Ok(tx),
            };
            this.dispatch_withdrawal(approved, reason).await
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("withdrawal task failed: {}", e)))?
    }

    fn scoped_key(user_id: &str, key: &str) -> String {
        format!("{}:{}", user_id, key)
    }

    /// The transaction an idempotency key already points at, if any.
    async fn replay(&self, scoped_key: Option<&str>) -> OrchestratorResult<Option<Transaction>> {
        let key = match scoped_key {
            Some(key) => key,
            None => return Ok(None),
        };
        match self.idempotency.get(key).await? {
            Some(id) => {
                let existing = self.wait_for_record(key, id).await?;
                info!(
                    transaction_id = %existing.id,
                    state = %existing.state,
                    "returning transaction for repeated idempotency key"
                );
                Ok(Some(existing))
            }
            None => Ok(None),
        }
    }

    /// The claim and the ledger insert are two writes, so a concurrent
    /// request can see the key a moment before the record exists.
    async fn wait_for_record(&self, key: &str, id: Uuid) -> OrchestratorResult<Transaction> {
        for _ in 0..IDEMPOTENCY_LOOKUP_ATTEMPTS {
            if let Some(tx) = self.ledger.get(id).await? {
                return Ok(tx);
            }
            tokio::time::sleep(IDEMPOTENCY_LOOKUP_DELAY).await;
        }
        Err(OrchestratorError::IdempotencyInFlight {
            key: key.to_string(),
        })
    }

    async fn validate(
        &self,
        provider: ProviderName,
        amount: i64,
        currency: &str,
    ) -> OrchestratorResult<Provider> {
        if self.registry.get(provider).is_none() {
            return Err(OrchestratorError::ProviderUnavailable { provider });
        }
        let adapter = self
            .registry
            .get_enabled(provider)
            .await
            .map_err(|e| OrchestratorError::validation("provider", e.user_message()))?;

        if amount <= 0 || amount < self.config.min_amount {
            return Err(OrchestratorError::validation(
                "amount",
                format!("amount must be at least {}", self.config.min_amount.max(1)),
            ));
        }
        if let Some(max) = self.config.max_amount {
            if amount > max {
                return Err(OrchestratorError::validation(
                    "amount",
                    format!("amount must be at most {}", max),
                ));
            }
        }
        if !self.config.supports_currency(currency) || !adapter.supports_currency(currency) {
            return Err(OrchestratorError::validation(
                "currency",
                format!("currency {} is not supported by {}", currency, provider),
            ));
        }
        Ok(adapter)
    }

    async fn claim_and_insert(
        &self,
        tx: Transaction,
        scoped_key: Option<String>,
    ) -> OrchestratorResult<Claimed> {
        if let Some(key) = scoped_key.as_deref() {
            if let IdempotencyClaim::Existing(id) =
                self.idempotency.put_if_absent(key, tx.id).await?
            {
                debug!(transaction_id = %id, "idempotency key claimed by a concurrent request");
                return Ok(Claimed::Existing(self.wait_for_record(key, id).await?));
            }
        }

        if let Err(e) = self.ledger.insert(&tx).await {
            if let Some(key) = scoped_key.as_deref() {
                if let Err(release) = self.idempotency.remove(key).await {
                    warn!(error = %release, "failed to release idempotency key");
                }
            }
            return Err(e.into());
        }

        info!(
            transaction_id = %tx.id,
            kind = %tx.kind,
            provider = %tx.provider,
            user_id = %tx.user_id,
            amount = tx.amount,
            currency = %tx.currency,
            recipient = %tx.recipient.phone_number.as_deref().map(mask_phone).unwrap_or_default(),
            "transaction created"
        );
        self.publish(TransactionEventType::Created, &tx);
        Ok(Claimed::Inserted(tx))
    }

    async fn reject(&self, id: Uuid, reason: &'static str) -> OrchestratorResult<Transaction> {
        self.modify(id, |tx, now| {
            if tx.is_terminal() {
                return Ok(false);
            }
            Self::apply(tx, TransactionState::Rejected, Some(reason.to_string()), now)?;
            Ok(true)
        })
        .await
    }

    /// Place the balance hold and move `pending -> approved`.
    async fn approve_withdrawal(&self, tx: Transaction) -> OrchestratorResult<Approval> {
        let _guard = self.lock_user(&tx.user_id).await;

        match self
            .balances
            .debit(&tx.user_id, &tx.currency, tx.amount)
            .await
        {
            Ok(remaining) => {
                debug!(transaction_id = %tx.id, remaining = remaining, "withdrawal hold placed");
            }
            Err(BalanceError::Insufficient { available, .. }) => {
                info!(
                    transaction_id = %tx.id,
                    available = available,
                    requested = tx.amount,
                    "withdrawal rejected for insufficient balance"
                );
                let rejected = self.reject(tx.id, reasons::INSUFFICIENT_BALANCE).await?;
                return Ok(Approval::Rejected(rejected));
            }
            Err(e) => {
                error!(transaction_id = %tx.id, error = %e, "balance store unavailable");
                let failed = self
                    .modify(tx.id, |tx, now| {
                        if tx.is_terminal() {
                            return Ok(false);
                        }
                        Self::apply(
                            tx,
                            TransactionState::Failed,
                            Some(reasons::BALANCE_UNAVAILABLE.to_string()),
                            now,
                        )?;
                        Ok(true)
                    })
                    .await?;
                return Ok(Approval::Rejected(failed));
            }
        }

        let mut approved_now = false;
        let approved = self
            .modify(tx.id, |tx, now| {
                approved_now = false;
                if tx.is_terminal() {
                    return Ok(false);
                }
                Self::apply(tx, TransactionState::Approved, None, now)?;
                approved_now = true;
                Ok(true)
            })
            .await;

        // The hold must not outlive a record that never got approved.
        match approved {
            Ok(saved) if approved_now => Ok(Approval::Approved(saved)),
            Ok(saved) => {
                self.restore_balance(&tx).await;
                Ok(Approval::Rejected(saved))
            }
            Err(e) => {
                self.restore_balance(&tx).await;
                Err(e)
            }
        }
    }

    async fn lock_user(&self, user_id: &str) -> UserLock {
        let lock = self
            .user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        UserLock {
            guard: Some(lock.lock_owned().await),
            locks: self.user_locks.clone(),
            user_id: user_id.to_string(),
        }
    }

    // =========================================================================
    // Provider dispatch
    // =========================================================================

    async fn dispatch_deposit(
        &self,
        tx: Transaction,
        description: Option<String>,
    ) -> OrchestratorResult<Transaction> {
        let provider = self.adapter(tx.provider)?;
        let request = DepositRequest {
            amount: tx.amount,
            currency: tx.currency.clone(),
            order_ref: tx.id.to_string(),
            recipient: tx.recipient.clone(),
            description,
        };
        let summary = json!({
            "amount": request.amount,
            "currency": request.currency,
            "orderRef": request.order_ref,
        });

        let (tx, started) = self.begin_dispatch(tx.id, &summary).await?;
        if !started {
            return Ok(tx);
        }

        let outcome = self
            .retry
            .run("create_deposit", |_| {
                let provider = provider.clone();
                let request = request.clone();
                async move { provider.create_deposit(request).await }
            })
            .await;
        self.record_health(tx.provider, &outcome).await;

        let result = outcome.result.map(|response| Accepted {
            provider_order_id: response.provider_order_id,
            pay_action: Some(response.pay_action),
            note: None,
        });
        self.finish_dispatch(
            tx.id,
            "create_deposit",
            &summary,
            TransactionState::Pending,
            outcome.failed_attempts,
            result,
        )
        .await
    }

    async fn dispatch_withdrawal(
        &self,
        tx: Transaction,
        reason: Option<String>,
    ) -> OrchestratorResult<Transaction> {
        let provider = self.adapter(tx.provider)?;
        let request = WithdrawalRequest {
            amount: tx.amount,
            currency: tx.currency.clone(),
            order_ref: tx.id.to_string(),
            recipient: tx.recipient.clone(),
            reason,
        };
        let summary = json!({
            "amount": request.amount,
            "currency": request.currency,
            "orderRef": request.order_ref,
        });

        let (tx, started) = self.begin_dispatch(tx.id, &summary).await?;
        if !started {
            return Ok(tx);
        }

        let outcome = self
            .retry
            .run("create_withdrawal", |_| {
                let provider = provider.clone();
                let request = request.clone();
                async move { provider.create_withdrawal(request).await }
            })
            .await;
        self.record_health(tx.provider, &outcome).await;

        let result = outcome.result.map(|response| Accepted {
            provider_order_id: response.provider_order_id,
            pay_action: None,
            note: None,
        });
        self.finish_dispatch(
            tx.id,
            "create_withdrawal",
            &summary,
            TransactionState::Approved,
            outcome.failed_attempts,
            result,
        )
        .await
    }

    /// Write the dispatch marker. Once it is on the record a caller cancel
    /// is refused until the provider's answer lands; a record closed before
    /// the marker is never sent to the provider.
    async fn begin_dispatch(
        &self,
        id: Uuid,
        summary: &serde_json::Value,
    ) -> OrchestratorResult<(Transaction, bool)> {
        let mut started = false;
        let tx = self
            .modify(id, |tx, now| {
                started = false;
                if tx.is_terminal() {
                    return Ok(false);
                }
                tx.record(Attempt::new(DISPATCH_ACTION, now).request(summary.clone()));
                started = true;
                Ok(true)
            })
            .await?;
        if !started {
            info!(
                transaction_id = %tx.id,
                state = %tx.state,
                "transaction closed before dispatch, provider not called"
            );
        }
        Ok((tx, started))
    }

    /// Record the provider's answer to a create call. `ready` is the state
    /// the record waits in before the provider accepts it.
    async fn finish_dispatch(
        &self,
        id: Uuid,
        action: &'static str,
        summary: &serde_json::Value,
        ready: TransactionState,
        failed_attempts: Vec<PaymentError>,
        result: PaymentResult<Accepted>,
    ) -> OrchestratorResult<Transaction> {
        // Our order reference is the transaction id, so a duplicate after a
        // retry means an earlier attempt reached the provider.
        let result = match result {
            Err(e) if e.is_duplicate_order() && !failed_attempts.is_empty() => {
                warn!(
                    transaction_id = %id,
                    action = action,
                    attempts = failed_attempts.len() + 1,
                    "provider already holds this order from an earlier attempt"
                );
                Ok(Accepted {
                    provider_order_id: id.to_string(),
                    pay_action: None,
                    note: Some(e.to_string()),
                })
            }
            other => other,
        };

        let mut closed_as = None;
        let saved = self
            .modify(id, |tx, now| {
                closed_as = None;
                if tx.is_terminal() {
                    closed_as = Some(tx.state);
                    return Ok(false);
                }
                Self::record_failed_attempts(tx, action, summary, &failed_attempts, now);
                match &result {
                    Ok(accepted) => {
                        let mut attempt = Attempt::new(action, now)
                            .request(summary.clone())
                            .response(json!({
                                "providerOrderId": accepted.provider_order_id,
                                "payAction": accepted.pay_action,
                            }));
                        if let Some(note) = &accepted.note {
                            attempt = attempt.error(note.clone());
                        }
                        tx.record(attempt);
                        if tx.provider_order_id.is_none() {
                            tx.provider_order_id = Some(accepted.provider_order_id.clone());
                        }
                        if tx.pay_action.is_none() {
                            tx.pay_action = accepted.pay_action.clone();
                        }
                        if tx.state == ready {
                            Self::apply(tx, TransactionState::Processing, None, now)?;
                        }
                    }
                    Err(e) => {
                        tx.record(
                            Attempt::new(action, now)
                                .request(summary.clone())
                                .error(e.to_string()),
                        );
                        Self::apply(tx, TransactionState::Failed, Some(e.reason_code()), now)?;
                    }
                }
                Ok(true)
            })
            .await?;

        if let Some(state) = closed_as {
            match &result {
                Ok(accepted) => {
                    warn!(
                        transaction_id = %id,
                        state = %state,
                        provider_order_id = %accepted.provider_order_id,
                        "provider accepted an order for a transaction that was already closed"
                    );
                    if matches!(state, TransactionState::Failed | TransactionState::Rejected) {
                        self.cancel_order(saved.provider, &accepted.provider_order_id, id)
                            .await;
                    }
                }
                Err(e) => warn!(
                    transaction_id = %id,
                    state = %state,
                    error = %e,
                    "provider answered after the transaction was closed"
                ),
            }
            return Ok(saved);
        }

        match &result {
            Ok(_) => info!(
                transaction_id = %saved.id,
                provider = %saved.provider,
                action = action,
                provider_order_id = ?saved.provider_order_id,
                attempts = failed_attempts.len() + 1,
                state = %saved.state,
                "transaction dispatched"
            ),
            Err(e) => warn!(
                transaction_id = %saved.id,
                provider = %saved.provider,
                action = action,
                attempts = failed_attempts.len() + 1,
                error = %e,
                "provider rejected transaction"
            ),
        }
        Ok(saved)
    }

    fn record_failed_attempts(
        tx: &mut Transaction,
        action: &str,
        summary: &serde_json::Value,
        failed: &[PaymentError],
        now: DateTime<Utc>,
    ) {
        for e in failed {
            tx.record(
                Attempt::new(action, now)
                    .request(summary.clone())
                    .error(e.to_string()),
            );
        }
    }

    async fn record_health<T>(&self, provider: ProviderName, outcome: &RetryOutcome<T>) {
        for _ in &outcome.failed_attempts {
            self.registry.record_failure(provider).await;
        }
        match &outcome.result {
            Ok(_) => self.registry.record_success(provider).await,
            // Business rejections say nothing about provider health.
            Err(e) if e.is_retryable() => self.registry.record_failure(provider).await,
            Err(_) => self.registry.record_success(provider).await,
        }
    }

    fn adapter(&self, name: ProviderName) -> OrchestratorResult<Provider> {
        self.registry
            .get(name)
            .ok_or(OrchestratorError::ProviderUnavailable { provider: name })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_transaction(&self, id: Uuid) -> OrchestratorResult<Transaction> {
        self.ledger
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::TransactionNotFound {
                transaction_id: id.to_string(),
            })
    }

    pub async fn list_transactions(
        &self,
        user_id: &str,
        state: Option<TransactionState>,
    ) -> OrchestratorResult<Vec<Transaction>> {
        Ok(self.ledger.list_by_user(user_id, state).await?)
    }

    // =========================================================================
    // Provider outcomes
    // =========================================================================

    /// Apply a verified provider callback.
    ///
    /// Safe to call any number of times with the same event: a repeated
    /// event id or an already-terminal record leaves the ledger untouched.
    pub async fn apply_webhook_event(
        &self,
        event: WebhookEvent,
    ) -> OrchestratorResult<(Transaction, SettlementOutcome)> {
        let tx = self.find_for_event(&event).await?;
        self.apply_settlement(tx.id, &event, "webhook").await
    }

    /// Apply a status poll result as if the provider had sent it.
    pub async fn apply_provider_status(
        &self,
        transaction_id: Uuid,
        status: &StatusResponse,
    ) -> OrchestratorResult<(Transaction, SettlementOutcome)> {
        let tx = self.get_transaction(transaction_id).await?;
        let event = WebhookEvent {
            provider: tx.provider,
            event_id: format!(
                "reconciliation:{}:{}",
                tx.id,
                serde_json::to_value(status.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            ),
            provider_order_id: tx.provider_order_id.clone(),
            order_ref: Some(tx.id.to_string()),
            status: status.status,
            amount: status.amount,
            occurred_at: status.completed_at,
            failure_reason: status.failure_reason.clone(),
            payload: serde_json::to_value(status).unwrap_or_default(),
        };
        self.apply_settlement(tx.id, &event, "reconciliation").await
    }

    async fn find_for_event(&self, event: &WebhookEvent) -> OrchestratorResult<Transaction> {
        if let Some(provider_order_id) = event.provider_order_id.as_deref() {
            if let Some(tx) = self
                .ledger
                .find_by_provider_order(event.provider, provider_order_id)
                .await?
            {
                return Ok(tx);
            }
        }
        // The callback can beat the dispatch write, before the provider order
        // id is on the record; our own id travels as the order reference.
        if let Some(id) = event
            .order_ref
            .as_deref()
            .and_then(|r| Uuid::parse_str(r).ok())
        {
            if let Some(tx) = self.ledger.get(id).await? {
                if tx.provider == event.provider {
                    return Ok(tx);
                }
            }
        }
        Err(OrchestratorError::TransactionNotFound {
            transaction_id: event
                .provider_order_id
                .clone()
                .or_else(|| event.order_ref.clone())
                .unwrap_or_default(),
        })
    }

    async fn apply_settlement(
        &self,
        id: Uuid,
        event: &WebhookEvent,
        source: &'static str,
    ) -> OrchestratorResult<(Transaction, SettlementOutcome)> {
        let mut outcome = SettlementOutcome::Recorded;
        let saved = self
            .modify(id, |tx, now| {
                if tx.has_event(&event.event_id) {
                    outcome = SettlementOutcome::Duplicate;
                    return Ok(false);
                }
                if tx.is_terminal() {
                    outcome = SettlementOutcome::AlreadyTerminal;
                    return Ok(false);
                }

                let mut attempt = Attempt::new(source, now)
                    .response(event.payload.clone())
                    .event(event.event_id.clone());

                if let Some(amount) = event.amount {
                    if amount != tx.amount {
                        warn!(
                            transaction_id = %tx.id,
                            expected = tx.amount,
                            reported = amount,
                            "provider reported a different amount, leaving state unchanged"
                        );
                        tx.record(attempt.error("AMOUNT_MISMATCH"));
                        outcome = SettlementOutcome::Recorded;
                        return Ok(true);
                    }
                }

                // An order accepted on a duplicate reply is keyed by our own id
                // until the provider tells us its real one.
                if let Some(poid) = &event.provider_order_id {
                    let own_ref = tx.id.to_string();
                    if tx.provider_order_id.is_none()
                        || tx.provider_order_id.as_deref() == Some(own_ref.as_str())
                    {
                        tx.provider_order_id = Some(poid.clone());
                    }
                }

                match event.status {
                    ProviderStatus::Success => {
                        match Self::step_to_processing(tx, now)? {
                            true => {
                                Self::apply(tx, TransactionState::Completed, None, now)?;
                                outcome = SettlementOutcome::Applied;
                            }
                            false => {
                                attempt = attempt.error("NOT_YET_DISPATCHED");
                                outcome = SettlementOutcome::Recorded;
                            }
                        }
                    }
                    ProviderStatus::Failed => {
                        let reason = event
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| reasons::PROVIDER_FAILED.to_string());
                        Self::apply(tx, TransactionState::Failed, Some(reason), now)?;
                        outcome = SettlementOutcome::Applied;
                    }
                    ProviderStatus::Pending => {
                        outcome = SettlementOutcome::Recorded;
                    }
                }
                tx.record(attempt);
                Ok(true)
            })
            .await?;

        info!(
            transaction_id = %saved.id,
            provider = %saved.provider,
            event_id = %event.event_id,
            source = source,
            outcome = ?outcome,
            state = %saved.state,
            "provider outcome applied"
        );
        Ok((saved, outcome))
    }

    /// Bring the record to `processing` if its kind allows it from here.
    /// Returns false for a withdrawal that has not been approved yet.
    fn step_to_processing(tx: &mut Transaction, now: DateTime<Utc>) -> OrchestratorResult<bool> {
        match (tx.kind, tx.state) {
            (_, TransactionState::Processing) => Ok(true),
            (TransactionKind::Withdrawal, TransactionState::Approved)
            | (TransactionKind::Deposit, TransactionState::Pending)
            | (TransactionKind::Refund, TransactionState::Pending) => {
                Self::apply(
                    tx,
                    TransactionState::Processing,
                    Some("settled before dispatch was recorded".to_string()),
                    now,
                )?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Force a stuck transaction to `failed` and flag it for review.
    pub async fn fail_for_review(
        &self,
        id: Uuid,
        reason: &'static str,
    ) -> OrchestratorResult<Transaction> {
        let mut changed = false;
        let saved = self
            .modify(id, |tx, now| {
                if tx.is_terminal() {
                    return Ok(false);
                }
                tx.record(Attempt::new("reconciliation_timeout", now).error(reason));
                Self::apply(tx, TransactionState::Failed, Some(reason.to_string()), now)?;
                changed = true;
                Ok(true)
            })
            .await?;
        if changed {
            warn!(
                transaction_id = %saved.id,
                provider = %saved.provider,
                reason = reason,
                "transaction flagged for manual review"
            );
            self.publish(TransactionEventType::ReviewRequired, &saved);
        }
        Ok(saved)
    }

    // =========================================================================
    // Cancellation & refunds
    // =========================================================================

    /// Cancel a transaction that has not reached a terminal state. When an
    /// order already exists at the provider it is cancelled there first; a
    /// provider refusal leaves the record unchanged. While the create call
    /// is out and unanswered the cancel is refused with `DispatchInFlight`.
    pub async fn cancel_transaction(&self, id: Uuid) -> OrchestratorResult<Transaction> {
        let tx = self.get_transaction(id).await?;
        if tx.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                transaction_id: tx.id,
                source: TransitionError {
                    kind: tx.kind,
                    from: tx.state,
                    to: TransactionState::Failed,
                },
            });
        }

        if tx.provider_order_id.is_none() && tx.dispatch_started() {
            return Err(OrchestratorError::DispatchInFlight { transaction_id: tx.id });
        }

        let cancelled_order = tx.provider_order_id.clone();
        if let Some(provider_order_id) = cancelled_order.as_deref() {
            let provider = self.adapter(tx.provider)?;
            if let Err(e) = provider.cancel(provider_order_id).await {
                warn!(transaction_id = %tx.id, error = %e, "provider refused cancellation");
                let message = e.to_string();
                self.modify(id, |tx, now| {
                    if tx.is_terminal() {
                        return Ok(false);
                    }
                    tx.record(Attempt::new("cancel", now).error(message.clone()));
                    Ok(true)
                })
                .await?;
                return Err(e.into());
            }
        }

        let mut dispatch_raced = false;
        let saved = self
            .modify(id, |tx, now| {
                dispatch_raced = false;
                if tx.is_terminal() {
                    return Ok(false);
                }
                // The dispatch got ahead of us after the read above.
                if tx.provider_order_id != cancelled_order
                    || (cancelled_order.is_none() && tx.dispatch_started())
                {
                    dispatch_raced = true;
                    return Ok(false);
                }
                tx.record(Attempt::new("cancel", now).response(json!({ "cancelled": true })));
                Self::apply(
                    tx,
                    TransactionState::Failed,
                    Some(reasons::CANCELLED.to_string()),
                    now,
                )?;
                Ok(true)
            })
            .await?;
        if dispatch_raced {
            return Err(OrchestratorError::DispatchInFlight { transaction_id: id });
        }
        info!(transaction_id = %saved.id, state = %saved.state, "transaction cancelled");
        Ok(saved)
    }

    /// Best-effort provider cancel used before forcing a timeout.
    pub async fn cancel_at_provider(&self, tx: &Transaction) {
        if let Some(provider_order_id) = tx.provider_order_id.as_deref() {
            self.cancel_order(tx.provider, provider_order_id, tx.id).await;
        }
    }

    async fn cancel_order(&self, name: ProviderName, provider_order_id: &str, id: Uuid) {
        let Some(provider) = self.registry.get(name) else {
            return;
        };
        if let Err(e) = provider.cancel(provider_order_id).await {
            debug!(transaction_id = %id, error = %e, "provider cancel failed");
        }
    }

    /// Note a reconciliation poll that left the record where it was. The
    /// entry moves `updated_at`, so the next stale scan starts with other
    /// records.
    pub async fn record_poll(
        &self,
        id: Uuid,
        result: Result<serde_json::Value, String>,
    ) -> OrchestratorResult<Transaction> {
        self.modify(id, |tx, now| {
            if tx.is_terminal() {
                return Ok(false);
            }
            let attempt = Attempt::new("reconciliation_poll", now);
            tx.record(match &result {
                Ok(response) => attempt.response(response.clone()),
                Err(error) => attempt.error(error.clone()),
            });
            Ok(true)
        })
        .await
    }

    /// Refund a completed deposit: debits the user, records a completed
    /// `refund` transaction linked to the deposit, and marks the deposit
    /// `refunded`. Returns the refund record.
    pub async fn refund_transaction(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> OrchestratorResult<Transaction> {
        let owner = self.get_transaction(id).await?.user_id;
        let _guard = self.lock_user(&owner).await;

        let parent = self.get_transaction(id).await?;
        if parent.kind != TransactionKind::Deposit || parent.state != TransactionState::Completed
        {
            return Err(OrchestratorError::InvalidTransition {
                transaction_id: parent.id,
                source: TransitionError {
                    kind: parent.kind,
                    from: parent.state,
                    to: TransactionState::Refunded,
                },
            });
        }

        match self
            .balances
            .debit(&parent.user_id, &parent.currency, parent.amount)
            .await
        {
            Ok(_) => {}
            Err(BalanceError::Insufficient {
                available,
                requested,
            }) => {
                return Err(OrchestratorError::InsufficientBalance {
                    available,
                    required: requested,
                })
            }
            Err(e) => return Err(OrchestratorError::Balance(e.to_string())),
        }

        let refund = Transaction::new(
            NewTransaction {
                kind: TransactionKind::Refund,
                provider: parent.provider,
                user_id: parent.user_id.clone(),
                amount: parent.amount,
                currency: parent.currency.clone(),
                recipient: parent.recipient.clone(),
                payment_method_id: None,
                idempotency_key: None,
                parent_transaction_id: Some(parent.id),
            },
            self.clock.now(),
        );
        if let Err(e) = self.ledger.insert(&refund).await {
            self.restore_balance(&parent).await;
            return Err(e.into());
        }
        self.publish(TransactionEventType::Created, &refund);

        let reason_text = reason.unwrap_or_else(|| "refund requested".to_string());
        let parent_id = parent.id;
        let completed = self
            .modify(refund.id, |tx, now| {
                tx.record(
                    Attempt::new("refund", now)
                        .request(json!({ "parentTransactionId": parent_id, "reason": reason_text })),
                );
                Self::apply(tx, TransactionState::Processing, None, now)?;
                Self::apply(tx, TransactionState::Completed, None, now)?;
                Ok(true)
            })
            .await?;

        let refund_id = completed.id;
        self.modify(parent.id, |tx, now| {
            if tx.state != TransactionState::Completed {
                return Ok(false);
            }
            tx.record(
                Attempt::new("refund", now)
                    .response(json!({ "refundTransactionId": refund_id, "reason": reason_text })),
            );
            Self::apply(tx, TransactionState::Refunded, Some(reason_text.clone()), now)?;
            Ok(true)
        })
        .await?;

        info!(
            transaction_id = %parent.id,
            refund_transaction_id = %completed.id,
            amount = completed.amount,
            "deposit refunded"
        );
        Ok(completed)
    }

    async fn restore_balance(&self, tx: &Transaction) {
        if let Err(e) = self.balances.credit(&tx.user_id, &tx.currency, tx.amount).await {
            error!(transaction_id = %tx.id, error = %e, "failed to restore balance");
        }
    }

    // =========================================================================
    // Ledger writes
    // =========================================================================

    fn apply(
        tx: &mut Transaction,
        to: TransactionState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        tx.transition(to, reason, now)
            .map_err(|source| OrchestratorError::InvalidTransition {
                transaction_id: tx.id,
                source,
            })
    }

    /// Read-modify-write with compare-and-set, re-running `change` on the
    /// fresh record after a lost race. `change` returns whether it modified
    /// the record; side effects of a state change run once the write lands.
    async fn modify<F>(&self, id: Uuid, mut change: F) -> OrchestratorResult<Transaction>
    where
        F: FnMut(&mut Transaction, DateTime<Utc>) -> OrchestratorResult<bool>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut tx = self.get_transaction(id).await?;
            let before = tx.state;
            if !change(&mut tx, self.clock.now())? {
                return Ok(tx);
            }
            match self.ledger.update(&tx).await {
                Ok(saved) => {
                    if saved.state != before {
                        info!(
                            transaction_id = %saved.id,
                            from_state = %before,
                            to_state = %saved.state,
                            "transaction state transitioned"
                        );
                        self.after_transition(before, &saved).await;
                    }
                    return Ok(saved);
                }
                Err(e) if e.is_version_conflict() => {
                    debug!(transaction_id = %id, attempt = attempt, "ledger write lost a race, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::WriteContention { transaction_id: id })
    }

    async fn after_transition(&self, before: TransactionState, tx: &Transaction) {
        match (tx.kind, tx.state) {
            (TransactionKind::Deposit, TransactionState::Completed) => {
                if let Err(e) = self.balances.credit(&tx.user_id, &tx.currency, tx.amount).await {
                    error!(transaction_id = %tx.id, error = %e, "failed to credit completed deposit");
                }
            }
            (TransactionKind::Withdrawal, TransactionState::Failed)
                if matches!(before, TransactionState::Approved | TransactionState::Processing) =>
            {
                self.restore_balance(tx).await;
            }
            _ => {}
        }
        if let Some(event_type) = TransactionEventType::for_state(tx.state) {
            self.publish(event_type, tx);
        }
    }

    fn publish(&self, event_type: TransactionEventType, tx: &Transaction) {
        if let Some(events) = &self.events {
            events.publish_event(TransactionEvent::new(event_type, tx));
        }
    }
}

/// Held for the duration of a per-user critical section. The table entry
/// goes away with the last holder.
struct UserLock {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    user_id: String,
}

impl Drop for UserLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// A create call the provider took on.
struct Accepted {
    provider_order_id: String,
    pay_action: Option<PayAction>,
    /// Set when acceptance was inferred from a duplicate-order reply.
    note: Option<String>,
}

enum Claimed {
    Inserted(Transaction),
    Existing(Transaction),
}

enum Approval {
    Approved(Transaction),
    Rejected(Transaction),
}
