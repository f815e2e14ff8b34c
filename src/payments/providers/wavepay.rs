use crate::payments::credentials::ProviderCredential;
use crate::payments::error::{PaymentError, PaymentResult, ProviderErrorCode};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    format_minor_units, DepositRequest, DepositResponse, PayAction, ProviderName, ProviderStatus,
    StatusResponse, WebhookEvent, WithdrawalRequest, WithdrawalResponse,
};
use crate::payments::utils::{hmac_sha256_hex, verify_hmac_sha256_hex, PaymentHttpClient};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{info, warn};

const TIME_TO_LIVE_SECS: u64 = 600;

pub struct WavePayProvider {
    credential: ProviderCredential,
    http: PaymentHttpClient,
}

impl WavePayProvider {
    pub fn new(credential: ProviderCredential) -> PaymentResult<Self> {
        let http =
            PaymentHttpClient::new("wavepay", Duration::from_secs(credential.timeout_secs))?;
        Ok(Self { credential, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(ProviderCredential::from_env(ProviderName::WavePay)?)
    }

    /// Wave hashes the ordered field values concatenated without separators.
    fn hash(&self, values: &[&str]) -> String {
        hmac_sha256_hex(&self.credential.secret_key, values.concat().as_bytes())
    }

    fn backend_result_url(&self) -> String {
        self.credential.notify_url.clone().unwrap_or_default()
    }

    fn check_response(&self, response: &WaveResponse, action: &str) -> PaymentResult<()> {
        if response.is_success() {
            return Ok(());
        }
        let code = map_error_code(response.code.as_deref().unwrap_or(&response.message));
        warn!(
            provider = "wavepay",
            action = action,
            message = %response.message,
            mapped = %code,
            "wavepay rejected request"
        );
        Err(PaymentError::provider("wavepay", code, response.message.clone()))
    }

    async fn post(&self, path: &str, body: &JsonValue) -> PaymentResult<WaveResponse> {
        self.http
            .request_json(
                reqwest::Method::POST,
                &self.credential.endpoint(path),
                None,
                Some(body),
                &[("Content-Type", "application/json")],
            )
            .await
    }
}

pub fn map_error_code(code: &str) -> ProviderErrorCode {
    match code.trim().to_uppercase().as_str() {
        "INVALID_HASH" | "UNAUTHORIZED" | "INVALID_MERCHANT" => {
            ProviderErrorCode::InvalidCredentials
        }
        "INVALID_AMOUNT" | "AMOUNT_LIMIT_EXCEEDED" => ProviderErrorCode::InvalidAmount,
        "INVALID_MSISDN" | "INVALID_PHONE_NUMBER" => ProviderErrorCode::InvalidPhone,
        "INSUFFICIENT_BALANCE" => ProviderErrorCode::InsufficientBalance,
        "ACCOUNT_LOCKED" | "ACCOUNT_BLOCKED" => ProviderErrorCode::AccountBlocked,
        "SERVICE_UNAVAILABLE" | "SYSTEM_BUSY" | "TRY_AGAIN_LATER" => ProviderErrorCode::ProviderBusy,
        "DUPLICATE_ORDER_ID" | "DUPLICATE_ORDER" => ProviderErrorCode::DuplicateOrder,
        "TRANSACTION_NOT_FOUND" | "ORDER_NOT_FOUND" => ProviderErrorCode::OrderNotFound,
        _ => ProviderErrorCode::Unknown,
    }
}

fn map_status(status: &str) -> ProviderStatus {
    match status.trim().to_uppercase().as_str() {
        "PAYMENT_CONFIRMED" | "SUCCESS" | "COMPLETED" => ProviderStatus::Success,
        "INSUFFICIENT_BALANCE"
        | "ACCOUNT_LOCKED"
        | "TRANSACTION_TIMED_OUT"
        | "PAYMENT_REJECTED"
        | "BILL_COLLECTION_FAILED"
        | "PAYMENT_REQUEST_CANCELLED"
        | "SCHEDULER_TRANSACTION_TIMED_OUT"
        | "FAILED" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

fn parse_request_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = value.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn string_field(value: &JsonValue, key: &str) -> String {
    match value.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

const CALLBACK_HASH_FIELDS: [&str; 11] = [
    "status",
    "timeToLiveSeconds",
    "merchantId",
    "orderId",
    "amount",
    "backendResultUrl",
    "merchantReferenceId",
    "initiatorMsisdn",
    "transactionId",
    "paymentRequestId",
    "requestTime",
];

#[async_trait]
impl PaymentProvider for WavePayProvider {
    async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
        let ttl = TIME_TO_LIVE_SECS.to_string();
        let amount = format_minor_units(request.amount, &request.currency);
        let backend_url = self.backend_result_url();
        let hash = self.hash(&[
            &ttl,
            &self.credential.merchant_id,
            &request.order_ref,
            &amount,
            &backend_url,
            &request.order_ref,
        ]);

        let description = request
            .description
            .clone()
            .unwrap_or_else(|| "Payment".to_string());
        let items = json!([{ "name": description, "amount": amount }]).to_string();

        let body = json!({
            "time_to_live_in_seconds": ttl,
            "merchant_id": self.credential.merchant_id,
            "order_id": request.order_ref,
            "merchant_reference_id": request.order_ref,
            "frontend_result_url": backend_url,
            "backend_result_url": backend_url,
            "amount": amount,
            "payment_description": description,
            "merchant_name": self.credential.app_id,
            "items": items,
            "hash": hash,
        });
        let response = self.post("/payment", &body).await?;
        self.check_response(&response, "create_deposit")?;

        let transaction_id = response.transaction_id.clone().ok_or_else(|| {
            PaymentError::provider(
                "wavepay",
                ProviderErrorCode::Unknown,
                "wavepay response is missing transaction_id",
            )
        })?;
        let url = response.authenticate_uri.clone().unwrap_or_else(|| {
            format!(
                "{}?transaction_id={}",
                self.credential.endpoint("/authenticate"),
                transaction_id
            )
        });
        info!(provider = "wavepay", order_ref = %request.order_ref, "wavepay payment requested");

        Ok(DepositResponse {
            provider_order_id: transaction_id,
            pay_action: PayAction::Redirect { url },
            provider_data: None,
        })
    }

    async fn create_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> PaymentResult<WithdrawalResponse> {
        let msisdn = request
            .recipient
            .phone_number
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::validation(
                    "recipient.phone_number is required for wavepay withdrawals",
                    Some("recipient.phone_number"),
                )
            })?;
        let amount = format_minor_units(request.amount, &request.currency);
        let hash = self.hash(&[&self.credential.merchant_id, &request.order_ref, &amount, &msisdn]);
        let body = json!({
            "merchant_id": self.credential.merchant_id,
            "order_id": request.order_ref,
            "amount": amount,
            "receiver_msisdn": msisdn,
            "remark": request.reason.clone().unwrap_or_default(),
            "hash": hash,
        });
        let response = self.post("/disbursement", &body).await?;
        self.check_response(&response, "create_withdrawal")?;

        Ok(WithdrawalResponse {
            provider_order_id: response
                .transaction_id
                .clone()
                .unwrap_or(request.order_ref),
            provider_data: None,
        })
    }

    async fn query_status(&self, provider_order_id: &str) -> PaymentResult<StatusResponse> {
        let hash = self.hash(&[&self.credential.merchant_id, provider_order_id]);
        let body = json!({
            "merchant_id": self.credential.merchant_id,
            "transaction_id": provider_order_id,
            "hash": hash,
        });
        let response = self.post("/payment/status", &body).await?;
        self.check_response(&response, "query_status")?;
        let status = map_status(response.status.as_deref().unwrap_or(""));

        Ok(StatusResponse {
            status,
            amount: response
                .amount
                .as_ref()
                .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))),
            completed_at: response.request_time.as_deref().and_then(parse_request_time),
            failure_reason: match status {
                ProviderStatus::Failed => response.status.clone(),
                _ => None,
            },
        })
    }

    async fn cancel(&self, provider_order_id: &str) -> PaymentResult<()> {
        let hash = self.hash(&[&self.credential.merchant_id, provider_order_id]);
        let body = json!({
            "merchant_id": self.credential.merchant_id,
            "transaction_id": provider_order_id,
            "hash": hash,
        });
        let response = self.post("/payment/cancel", &body).await?;
        self.check_response(&response, "cancel")
    }

    fn name(&self) -> ProviderName {
        ProviderName::WavePay
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["MMK"]
    }

    fn verify_webhook_signature(&self, payload: &[u8], _headers: &HeaderMap) -> bool {
        let parsed: JsonValue = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let provided = match parsed.get("hashValue").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => return false,
        };
        let message: String = CALLBACK_HASH_FIELDS
            .iter()
            .map(|field| string_field(&parsed, field))
            .collect();
        verify_hmac_sha256_hex(message.as_bytes(), self.credential.callback_secret(), &provided)
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid wavepay callback JSON: {}", e),
            }
        })?;
        let status_raw = string_field(&parsed, "status");
        let transaction_id = string_field(&parsed, "transactionId");
        let order_id = string_field(&parsed, "orderId");
        if transaction_id.is_empty() && order_id.is_empty() {
            return Err(PaymentError::WebhookVerificationError {
                message: "wavepay callback carries neither transactionId nor orderId".to_string(),
            });
        }
        let status = map_status(&status_raw);
        let amount = string_field(&parsed, "amount");

        Ok(WebhookEvent {
            provider: ProviderName::WavePay,
            event_id: format!("{}:{}", transaction_id, status_raw),
            provider_order_id: Some(transaction_id).filter(|v| !v.is_empty()),
            order_ref: Some(order_id).filter(|v| !v.is_empty()),
            status,
            amount: amount.split('.').next().and_then(|v| v.parse::<i64>().ok()),
            occurred_at: parse_request_time(&string_field(&parsed, "requestTime")),
            failure_reason: match status {
                ProviderStatus::Failed => Some(status_raw),
                _ => None,
            },
            payload: parsed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WaveResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    authenticate_uri: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<JsonValue>,
    #[serde(default, rename = "requestTime")]
    request_time: Option<String>,
}

impl WaveResponse {
    fn is_success(&self) -> bool {
        self.code.is_none() && self.message.eq_ignore_ascii_case("success")
    }
}
