//! End-to-end deposit through the KBZPay adapter against a local stand-in
//! for the KBZPay open API.

use axum::{body::Body, extract::State, routing::post, Json, Router};
use http::{Request, StatusCode};
use mmpay_orchestrator::api::{router, AppState};
use mmpay_orchestrator::cache::InMemoryIdempotencyStore;
use mmpay_orchestrator::clock::{Clock, ManualClock};
use mmpay_orchestrator::config::{ReconciliationConfig, WebhookConfig};
use mmpay_orchestrator::database::{InMemoryLedger, TransactionState};
use mmpay_orchestrator::health::HealthChecker;
use mmpay_orchestrator::payments::credentials::ProviderCredential;
use mmpay_orchestrator::payments::providers::kbzpay::KbzPayProvider;
use mmpay_orchestrator::payments::types::{
    PayAction, ProviderEnvironment, ProviderName, RecipientInfo,
};
use mmpay_orchestrator::payments::{Provider, ProviderRegistry, RetryPolicy};
use mmpay_orchestrator::services::{
    BalanceStore, CreateDepositRequest, InMemoryBalanceStore, OrchestratorConfig,
    PaymentOrchestrator, WebhookProcessor,
};
use mmpay_orchestrator::workers::ReconciliationWorker;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Default)]
struct KbzCounters {
    precreate: AtomicU32,
    queryorder: AtomicU32,
}

async fn precreate(State(counters): State<Arc<KbzCounters>>, Json(body): Json<Value>) -> Json<Value> {
    counters.precreate.fetch_add(1, Ordering::SeqCst);
    let order = body["Request"]["biz_content"]["merch_order_id"].clone();
    Json(json!({
        "Response": {
            "result": "SUCCESS",
            "code": "0",
            "msg": "success",
            "merch_order_id": order,
            "prepay_id": "KBZ0052ee3d2f6f4e8f",
            "qrCode": "00020101021226390014mm.com.kbzpay0106200001"
        }
    }))
}

async fn queryorder(State(counters): State<Arc<KbzCounters>>) -> Json<Value> {
    counters.queryorder.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "Response": { "result": "SUCCESS", "code": "0", "msg": "", "trade_status": "WAIT_PAY" }
    }))
}

async fn spawn_kbz_stub(counters: Arc<KbzCounters>) -> String {
    let app = Router::new()
        .route("/precreate", post(precreate))
        .route("/queryorder", post(queryorder))
        .with_state(counters);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn credential(base_url: String) -> ProviderCredential {
    ProviderCredential {
        provider: ProviderName::KbzPay,
        merchant_id: "200001".to_string(),
        app_id: "kp0480c579f02f48ae8c37ce82260511".to_string(),
        secret_key: "kbz_secret".to_string(),
        webhook_secret: None,
        base_url,
        environment: ProviderEnvironment::Sandbox,
        timeout_secs: 5,
        notify_url: Some("https://merchant.example.com/payments/webhooks/kbzpay".to_string()),
    }
}

fn signed_callback(provider: &KbzPayProvider, order_ref: &str, notify_time: i64) -> Vec<u8> {
    let mut request = json!({
        "merch_order_id": order_ref,
        "mm_order_id": "01100052026",
        "merch_code": "200001",
        "appid": "kp0480c579f02f48ae8c37ce82260511",
        "trade_status": "PAY_SUCCESS",
        "total_amount": "100000",
        "trans_currency": "MMK",
        "notify_time": notify_time.to_string(),
        "nonce_str": "5K8264ILTKCH16CQ2502SI8ZNMTM67VS",
        "sign_type": "SHA256",
    });
    let sign = provider.sign(&request);
    request["sign"] = json!(sign);
    serde_json::to_vec(&json!({ "Request": request })).unwrap()
}

#[tokio::test]
async fn kbzpay_deposit_completes_by_webhook_and_is_not_polled_afterwards() {
    let counters = Arc::new(KbzCounters::default());
    let base_url = spawn_kbz_stub(counters.clone()).await;
    let kbz = Arc::new(KbzPayProvider::new(credential(base_url)).unwrap());

    let clock = ManualClock::default();
    let registry = ProviderRegistry::new().with_provider(Provider::KbzPay(kbz.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new(
        chrono::Duration::hours(24),
        Arc::new(clock.clone()),
    ));
    let balances = Arc::new(InMemoryBalanceStore::new());
    let orchestrator = PaymentOrchestrator::new(
        registry.clone(),
        ledger.clone(),
        idempotency.clone(),
        OrchestratorConfig::default(),
    )
    .with_balances(balances.clone())
    .with_clock(Arc::new(clock.clone()))
    .with_retry_policy(RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)));

    let app = router(AppState {
        orchestrator: orchestrator.clone(),
        webhooks: WebhookProcessor::new(orchestrator.clone(), WebhookConfig::default()),
        health: HealthChecker::new(ledger, idempotency, registry),
        qr_merchants: Arc::new(HashMap::new()),
    });

    let tx = orchestrator
        .create_deposit(CreateDepositRequest {
            user_id: "user-1".to_string(),
            provider: ProviderName::KbzPay,
            amount: 100_000,
            currency: "MMK".to_string(),
            recipient: RecipientInfo::default(),
            description: Some("Top up".to_string()),
            idempotency_key: Some("topup-1".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(tx.state, TransactionState::Processing);
    assert_eq!(tx.provider_order_id.as_deref(), Some(tx.id.to_string().as_str()));
    assert!(matches!(tx.pay_action, Some(PayAction::QrCode { .. })));
    assert_eq!(counters.precreate.load(Ordering::SeqCst), 1);

    let body = signed_callback(&kbz, &tx.id.to_string(), clock.now().timestamp());
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/payments/webhooks/kbzpay")
                    .header("content-type", "application/json")
                    .body(Body::from(body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let mut settled = None;
    for _ in 0..200 {
        let current = orchestrator.get_transaction(tx.id).await.unwrap();
        if current.state == TransactionState::Completed {
            settled = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let settled = settled.expect("deposit should complete from the callback");
    let callback_entries = settled
        .attempts
        .iter()
        .filter(|a| a.event_id.is_some())
        .count();
    assert_eq!(callback_entries, 1);
    assert_eq!(balances.available("user-1", "MMK").await.unwrap(), 100_000);

    clock.advance(chrono::Duration::minutes(10));
    let worker = ReconciliationWorker::new(orchestrator.clone(), ReconciliationConfig::default());
    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(counters.queryorder.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tampered_kbzpay_callback_is_refused() {
    let counters = Arc::new(KbzCounters::default());
    let base_url = spawn_kbz_stub(counters).await;
    let kbz = Arc::new(KbzPayProvider::new(credential(base_url)).unwrap());
    let registry = ProviderRegistry::new().with_provider(Provider::KbzPay(kbz.clone()));
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = ManualClock::default();
    let idempotency = Arc::new(InMemoryIdempotencyStore::new(
        chrono::Duration::hours(24),
        Arc::new(clock.clone()),
    ));
    let orchestrator = PaymentOrchestrator::new(
        registry.clone(),
        ledger.clone(),
        idempotency.clone(),
        OrchestratorConfig::default(),
    )
    .with_clock(Arc::new(clock.clone()));
    let app = router(AppState {
        orchestrator: orchestrator.clone(),
        webhooks: WebhookProcessor::new(orchestrator, WebhookConfig::default()),
        health: HealthChecker::new(ledger, idempotency, registry),
        qr_merchants: Arc::new(HashMap::new()),
    });

    let body = signed_callback(&kbz, "f47ac10b-58cc-4372-a567-0e02b2c3d479", clock.now().timestamp());
    let tampered = String::from_utf8(body)
        .unwrap()
        .replace("\"100000\"", "\"900000\"");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/webhooks/kbzpay")
                .header("content-type", "application/json")
                .body(Body::from(tampered))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
