//! Payment endpoints under `/payments`.

use crate::api::AppState;
use crate::database::payment_method_repository::{PaymentMethod, PaymentMethodType};
use crate::database::transaction::{Transaction, TransactionState};
use crate::error::AppError;
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::registry::ProviderSummary;
use crate::payments::types::{ProviderName, RecipientInfo};
use crate::payments::utils::normalize_msisdn;
use crate::qr::{self, EncodedQr, MerchantAccount, QrPaymentRequest};
use crate::services::payment_orchestrator::{CreateDepositRequest, CreateWithdrawalRequest};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

type ApiResult<T> = Result<Json<T>, AppError>;

/// Attach the caller's request id so the error body can echo it.
fn with_request_id(headers: &HeaderMap, err: impl Into<AppError>) -> AppError {
    let err = err.into();
    match get_request_id_from_headers(headers) {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

fn parse_uuid(headers: &HeaderMap, field: &str, raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| with_request_id(headers, AppError::validation(field, "must be a UUID")))
}

fn parse_provider(headers: &HeaderMap, raw: &str) -> Result<ProviderName, AppError> {
    ProviderName::from_str(raw).map_err(|e| with_request_id(headers, e))
}

fn header_idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Transactions
// ============================================================================

/// POST /payments/deposit
pub async fn create_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CreateDepositRequest>,
) -> ApiResult<Transaction> {
    if request.idempotency_key.is_none() {
        request.idempotency_key = header_idempotency_key(&headers);
    }
    let tx = state
        .orchestrator
        .create_deposit(request)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(tx))
}

/// POST /payments/withdrawal
pub async fn create_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CreateWithdrawalRequest>,
) -> ApiResult<Transaction> {
    if request.idempotency_key.is_none() {
        request.idempotency_key = header_idempotency_key(&headers);
    }
    let tx = state
        .orchestrator
        .create_withdrawal(request)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(tx))
}

/// GET /payments/transactions/{id}
pub async fn get_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Transaction> {
    let id = parse_uuid(&headers, "id", &id)?;
    let tx = state
        .orchestrator
        .get_transaction(id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(tx))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub id: Uuid,
    pub state: TransactionState,
    pub provider: ProviderName,
    pub provider_order_id: Option<String>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionStatusResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            state: tx.state,
            provider: tx.provider,
            provider_order_id: tx.provider_order_id.clone(),
            failure_reason: tx.failure_reason.clone(),
            updated_at: tx.updated_at,
        }
    }
}

/// GET /payments/transactions/{id}/status
pub async fn get_transaction_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<TransactionStatusResponse> {
    let id = parse_uuid(&headers, "id", &id)?;
    let tx = state
        .orchestrator
        .get_transaction(id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(TransactionStatusResponse::from(&tx)))
}

/// POST /payments/transactions/{id}/cancel
pub async fn cancel_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Transaction> {
    let id = parse_uuid(&headers, "id", &id)?;
    let tx = state
        .orchestrator
        .cancel_transaction(id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    info!(transaction_id = %tx.id, state = %tx.state.as_str(), "transaction cancelled");
    Ok(Json(tx))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /payments/transactions/{id}/refund
///
/// The body is optional; an empty POST refunds without a reason.
pub async fn refund_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Transaction> {
    let id = parse_uuid(&headers, "id", &id)?;
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<RefundBody>(&body)
            .map_err(|e| with_request_id(&headers, AppError::validation("body", e.to_string())))?
            .reason
    };
    let refund = state
        .orchestrator
        .refund_transaction(id, reason)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(refund))
}

#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    pub state: Option<TransactionState>,
}

/// GET /payments/users/{user_id}/transactions?state=
pub async fn list_user_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<ListTransactionsQuery>,
) -> ApiResult<Vec<Transaction>> {
    let txs = state
        .orchestrator
        .list_transactions(&user_id, query.state)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(txs))
}

// ============================================================================
// Payment methods
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentMethodRequest {
    pub user_id: String,
    pub provider: ProviderName,
    pub method_type: PaymentMethodType,
    pub destination: RecipientInfo,
}

/// POST /payments/methods
pub async fn create_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreatePaymentMethodRequest>,
) -> ApiResult<PaymentMethod> {
    if request.user_id.trim().is_empty() {
        return Err(with_request_id(
            &headers,
            AppError::validation("userId", "must not be empty"),
        ));
    }
    let mut destination = request.destination;
    if let Some(phone) = destination.phone_number.as_deref() {
        let normalized = normalize_msisdn(phone).ok_or_else(|| {
            with_request_id(
                &headers,
                AppError::validation("destination.phone_number", "not a Myanmar mobile number"),
            )
        })?;
        destination.phone_number = Some(normalized);
    } else if destination.account_number.is_none() {
        return Err(with_request_id(
            &headers,
            AppError::validation("destination", "phone number or account number required"),
        ));
    }

    let method = PaymentMethod::new(
        request.user_id,
        request.provider,
        request.method_type,
        destination,
    );
    state
        .orchestrator
        .payment_methods()
        .create(&method)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(method))
}

/// POST /payments/methods/{id}/verify
pub async fn verify_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<PaymentMethod> {
    let id = parse_uuid(&headers, "id", &id)?;
    let method = state
        .orchestrator
        .payment_methods()
        .mark_verified(id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(method))
}

/// POST /payments/methods/{id}/deactivate
pub async fn deactivate_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<PaymentMethod> {
    let id = parse_uuid(&headers, "id", &id)?;
    let method = state
        .orchestrator
        .payment_methods()
        .deactivate(id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(method))
}

/// GET /payments/users/{user_id}/methods
pub async fn list_payment_methods(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<PaymentMethod>> {
    let methods = state
        .orchestrator
        .payment_methods()
        .list_by_user(&user_id)
        .await
        .map_err(|e| with_request_id(&headers, e))?;
    Ok(Json(methods))
}

// ============================================================================
// QR codes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeRequest {
    /// One provider gives a single-wallet code, several give a unified one.
    pub providers: Vec<ProviderName>,
    /// Decimal major units; omit for a static code.
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default = "default_qr_currency")]
    pub currency: String,
    pub merchant_name: String,
    pub merchant_city: String,
    #[serde(default)]
    pub merchant_category_code: Option<String>,
    #[serde(default)]
    pub bill_number: Option<String>,
    #[serde(default)]
    pub reference_label: Option<String>,
}

fn default_qr_currency() -> String {
    "MMK".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    #[serde(flatten)]
    pub encoded: EncodedQr,
    pub providers: Vec<ProviderName>,
    pub unified: bool,
}

/// POST /payments/qr-code
pub async fn generate_qr_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QrCodeRequest>,
) -> ApiResult<QrCodeResponse> {
    let mut providers = request.providers;
    providers.sort();
    providers.dedup();
    if providers.is_empty() {
        return Err(with_request_id(
            &headers,
            AppError::validation("providers", "at least one provider required"),
        ));
    }

    let mut accounts = Vec::with_capacity(providers.len());
    for provider in &providers {
        let merchant_id = state.qr_merchants.get(provider).ok_or_else(|| {
            with_request_id(
                &headers,
                AppError::validation(
                    "providers",
                    format!("no merchant account configured for {}", provider),
                ),
            )
        })?;
        accounts.push(MerchantAccount::for_provider(*provider, merchant_id.clone()));
    }

    let encoded = qr::encode(&QrPaymentRequest {
        accounts,
        amount: request.amount,
        currency: request.currency,
        merchant_name: request.merchant_name,
        merchant_city: request.merchant_city,
        merchant_category_code: request.merchant_category_code,
        country_code: None,
        bill_number: request.bill_number,
        reference_label: request.reference_label,
    })
    .map_err(|e| with_request_id(&headers, e))?;

    Ok(Json(QrCodeResponse {
        unified: providers.len() > 1,
        providers,
        encoded,
    }))
}

// ============================================================================
// Providers
// ============================================================================

/// GET /payments/providers
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderSummary>> {
    Json(state.orchestrator.registry().summaries().await)
}

/// POST /payments/providers/{provider}/enable
pub async fn enable_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> ApiResult<serde_json::Value> {
    set_provider_enabled(&state, &headers, &provider, true).await
}

/// POST /payments/providers/{provider}/disable
pub async fn disable_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> ApiResult<serde_json::Value> {
    set_provider_enabled(&state, &headers, &provider, false).await
}

async fn set_provider_enabled(
    state: &AppState,
    headers: &HeaderMap,
    raw: &str,
    enabled: bool,
) -> ApiResult<serde_json::Value> {
    let provider = parse_provider(headers, raw)?;
    if !state
        .orchestrator
        .registry()
        .set_enabled(provider, enabled)
        .await
    {
        return Err(with_request_id(
            headers,
            AppError::validation("provider", format!("{} is not configured", provider)),
        ));
    }
    info!(provider = %provider, enabled, "provider toggled");
    Ok(Json(json!({ "provider": provider, "enabled": enabled })))
}
