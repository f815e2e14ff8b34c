#![allow(dead_code)]

use async_trait::async_trait;
use http::HeaderMap;
use mmpay_orchestrator::cache::InMemoryIdempotencyStore;
use mmpay_orchestrator::clock::ManualClock;
use mmpay_orchestrator::config::{ReconciliationConfig, WebhookConfig};
use mmpay_orchestrator::database::payment_method_repository::{PaymentMethod, PaymentMethodType};
use mmpay_orchestrator::database::{
    InMemoryLedger, InMemoryPaymentMethodStore, PaymentMethodStore, Transaction,
    TransactionState,
};
use mmpay_orchestrator::payments::error::{PaymentError, PaymentResult};
use mmpay_orchestrator::payments::provider::{PaymentProvider, Provider};
use mmpay_orchestrator::payments::registry::ProviderRegistry;
use mmpay_orchestrator::payments::retry::RetryPolicy;
use mmpay_orchestrator::payments::types::{
    DepositRequest, DepositResponse, PayAction, ProviderName, ProviderStatus, RecipientInfo,
    StatusResponse, WebhookEvent, WithdrawalRequest, WithdrawalResponse,
};
use mmpay_orchestrator::services::{
    BalanceStore, CreateDepositRequest, CreateWithdrawalRequest, InMemoryBalanceStore,
    OrchestratorConfig, PaymentOrchestrator,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "x-wallet-signature";
pub const GOOD_SIGNATURE: &str = "valid";

/// In-process wallet: accepts every order, reports whatever status the test
/// sets, and takes webhooks as plain JSON signed with a fixed header.
pub struct MockWallet {
    pub name: ProviderName,
    pub deposit_calls: AtomicU32,
    pub withdrawal_calls: AtomicU32,
    pub status_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
    pub status: Mutex<ProviderStatus>,
    pub latency: Duration,
    /// Errors returned, in order, before create calls start succeeding.
    pub deposit_errors: Mutex<VecDeque<PaymentError>>,
    pub withdrawal_errors: Mutex<VecDeque<PaymentError>>,
}

impl MockWallet {
    pub fn new(name: ProviderName) -> Self {
        Self {
            name,
            deposit_calls: AtomicU32::new(0),
            withdrawal_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
            status: Mutex::new(ProviderStatus::Pending),
            latency: Duration::from_millis(0),
            deposit_errors: Mutex::new(VecDeque::new()),
            withdrawal_errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing_deposits(self, errors: Vec<PaymentError>) -> Self {
        *self.deposit_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn failing_withdrawals(self, errors: Vec<PaymentError>) -> Self {
        *self.withdrawal_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_status(&self, status: ProviderStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn deposits(&self) -> u32 {
        self.deposit_calls.load(Ordering::SeqCst)
    }

    pub fn withdrawals(&self) -> u32 {
        self.withdrawal_calls.load(Ordering::SeqCst)
    }

    pub fn status_queries(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct MockCallback {
    event_id: String,
    order_ref: String,
    status: String,
    amount: Option<i64>,
}

#[async_trait]
impl PaymentProvider for MockWallet {
    async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
        self.deposit_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let scripted = self.deposit_errors.lock().unwrap().pop_front();
        if let Some(e) = scripted {
            return Err(e);
        }
        Ok(DepositResponse {
            provider_order_id: format!("MOCK-{}", request.order_ref),
            pay_action: PayAction::Redirect {
                url: format!("https://wallet.test/pay/{}", request.order_ref),
            },
            provider_data: None,
        })
    }

    async fn create_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> PaymentResult<WithdrawalResponse> {
        self.withdrawal_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let scripted = self.withdrawal_errors.lock().unwrap().pop_front();
        if let Some(e) = scripted {
            return Err(e);
        }
        Ok(WithdrawalResponse {
            provider_order_id: format!("MOCK-WD-{}", request.order_ref),
            provider_data: None,
        })
    }

    async fn query_status(&self, _provider_order_id: &str) -> PaymentResult<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        Ok(StatusResponse {
            status,
            amount: None,
            completed_at: None,
            failure_reason: match status {
                ProviderStatus::Failed => Some("DECLINED".to_string()),
                _ => None,
            },
        })
    }

    async fn cancel(&self, _provider_order_id: &str) -> PaymentResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> ProviderName {
        self.name
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["MMK"]
    }

    fn verify_webhook_signature(&self, _payload: &[u8], headers: &HeaderMap) -> bool {
        headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == GOOD_SIGNATURE)
            .unwrap_or(false)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let callback: MockCallback = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: e.to_string(),
            }
        })?;
        let status = match callback.status.as_str() {
            "success" => ProviderStatus::Success,
            "failed" => ProviderStatus::Failed,
            _ => ProviderStatus::Pending,
        };
        Ok(WebhookEvent {
            provider: self.name,
            event_id: callback.event_id,
            provider_order_id: None,
            order_ref: Some(callback.order_ref),
            status,
            amount: callback.amount,
            occurred_at: None,
            failure_reason: match status {
                ProviderStatus::Failed => Some("DECLINED".to_string()),
                _ => None,
            },
            payload: json!({}),
        })
    }
}

pub fn callback_body(event_id: &str, tx: &Transaction, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event_id": event_id,
        "order_ref": tx.id.to_string(),
        "status": status,
        "amount": tx.amount,
    }))
    .unwrap()
}

pub fn event(event_id: &str, tx: &Transaction, status: ProviderStatus) -> WebhookEvent {
    WebhookEvent {
        provider: tx.provider,
        event_id: event_id.to_string(),
        provider_order_id: tx.provider_order_id.clone(),
        order_ref: Some(tx.id.to_string()),
        status,
        amount: Some(tx.amount),
        occurred_at: None,
        failure_reason: match status {
            ProviderStatus::Failed => Some("DECLINED".to_string()),
            _ => None,
        },
        payload: json!({}),
    }
}

pub struct Harness {
    pub orchestrator: PaymentOrchestrator,
    pub ledger: Arc<InMemoryLedger>,
    pub balances: Arc<InMemoryBalanceStore>,
    pub methods: Arc<InMemoryPaymentMethodStore>,
    pub clock: ManualClock,
    pub wallet: Arc<MockWallet>,
}

pub fn harness() -> Harness {
    harness_with(MockWallet::new(ProviderName::KbzPay))
}

pub fn harness_with(wallet: MockWallet) -> Harness {
    let wallet = Arc::new(wallet);
    let registry = ProviderRegistry::new().with_provider(Provider::Custom(wallet.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let balances = Arc::new(InMemoryBalanceStore::new());
    let methods = Arc::new(InMemoryPaymentMethodStore::new());
    let clock = ManualClock::default();

    let orchestrator = PaymentOrchestrator::new(
        registry,
        ledger.clone(),
        Arc::new(InMemoryIdempotencyStore::new(
            chrono::Duration::hours(24),
            Arc::new(clock.clone()),
        )),
        OrchestratorConfig::default(),
    )
    .with_balances(balances.clone())
    .with_payment_methods(methods.clone())
    .with_clock(Arc::new(clock.clone()))
    .with_retry_policy(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(4),
    ));

    Harness {
        orchestrator,
        ledger,
        balances,
        methods,
        clock,
        wallet,
    }
}

impl Harness {
    pub fn deposit(&self, user: &str, amount: i64, key: Option<&str>) -> CreateDepositRequest {
        CreateDepositRequest {
            user_id: user.to_string(),
            provider: self.wallet.name,
            amount,
            currency: "MMK".to_string(),
            recipient: RecipientInfo {
                phone_number: Some("09791234567".to_string()),
                ..Default::default()
            },
            description: None,
            idempotency_key: key.map(str::to_string),
        }
    }

    pub fn withdrawal(&self, user: &str, amount: i64, method_id: Uuid) -> CreateWithdrawalRequest {
        CreateWithdrawalRequest {
            user_id: user.to_string(),
            provider: self.wallet.name,
            amount,
            currency: "MMK".to_string(),
            payment_method_id: method_id,
            reason: None,
            idempotency_key: None,
        }
    }

    /// A verified wallet destination for `user`.
    pub async fn verified_method(&self, user: &str) -> Uuid {
        let method = PaymentMethod::new(
            user,
            self.wallet.name,
            PaymentMethodType::Wallet,
            RecipientInfo {
                phone_number: Some("09791234567".to_string()),
                ..Default::default()
            },
        );
        self.methods.create(&method).await.unwrap();
        self.methods.mark_verified(method.id).await.unwrap();
        method.id
    }

    pub async fn fund(&self, user: &str, amount: i64) {
        self.balances.credit(user, "MMK", amount).await.unwrap();
    }

    pub async fn balance(&self, user: &str) -> i64 {
        self.balances.available(user, "MMK").await.unwrap()
    }

    pub async fn state_of(&self, id: Uuid) -> TransactionState {
        self.orchestrator.get_transaction(id).await.unwrap().state
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig::default()
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig::default()
    }
}

/// The record of a deposit whose provider call is still out.
pub async fn wait_for_provider_call(h: &Harness, user: &str) -> Transaction {
    for _ in 0..200 {
        if h.wallet.deposits() > 0 {
            let records = h.orchestrator.list_transactions(user, None).await.unwrap();
            if let Some(tx) = records.into_iter().next() {
                return tx;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provider was never called for {}", user);
}

/// Poll until `id` reaches `state`; webhook application runs detached.
pub async fn wait_for_state(orchestrator: &PaymentOrchestrator, id: Uuid, state: TransactionState) {
    for _ in 0..200 {
        if orchestrator.get_transaction(id).await.unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transaction {} never reached {:?}", id, state);
}
