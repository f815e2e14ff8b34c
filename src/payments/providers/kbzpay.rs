use crate::payments::credentials::ProviderCredential;
use crate::payments::error::{PaymentError, PaymentResult, ProviderErrorCode};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    format_minor_units, DepositRequest, DepositResponse, PayAction, ProviderName, ProviderStatus,
    StatusResponse, WebhookEvent, WithdrawalRequest, WithdrawalResponse,
};
use crate::payments::utils::{
    json_params, secure_eq, sha256_hex_upper, sorted_param_string, PaymentHttpClient,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SIGN_EXCLUDED: &[&str] = &["sign", "sign_type"];

/// KBZPay open API adapter.
///
/// Requests are wrapped as `{"Request": {...}}` and signed with an
/// uppercase SHA-256 over the sorted parameter string followed by
/// `&key=<secret>`. `biz_content` members take part in the signature as if
/// they were top-level parameters.
pub struct KbzPayProvider {
    credential: ProviderCredential,
    http: PaymentHttpClient,
}

impl KbzPayProvider {
    pub fn new(credential: ProviderCredential) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new("kbzpay", Duration::from_secs(credential.timeout_secs))?;
        Ok(Self { credential, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(ProviderCredential::from_env(ProviderName::KbzPay)?)
    }

    pub fn sign(&self, params: &JsonValue) -> String {
        let mut flat = json_params(params);
        if let Some(biz) = params.get("biz_content") {
            flat.extend(json_params(biz));
        }
        let base = sorted_param_string(&flat, SIGN_EXCLUDED);
        sha256_hex_upper(&format!("{}&key={}", base, self.credential.secret_key))
    }

    fn envelope(&self, method: &str, biz_content: JsonValue) -> JsonValue {
        let mut request = json!({
            "timestamp": Utc::now().timestamp().to_string(),
            "method": method,
            "nonce_str": Uuid::new_v4().simple().to_string(),
            "version": "1.0",
            "notify_url": self.credential.notify_url.clone().unwrap_or_default(),
            "biz_content": biz_content,
        });
        let sign = self.sign(&request);
        if let Some(object) = request.as_object_mut() {
            object.insert("sign_type".to_string(), json!("SHA256"));
            object.insert("sign".to_string(), json!(sign));
        }
        json!({ "Request": request })
    }

    async fn call(
        &self,
        path: &str,
        method: &str,
        biz_content: JsonValue,
    ) -> PaymentResult<KbzResponse> {
        let body = self.envelope(method, biz_content);
        let raw: KbzEnvelope = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.credential.endpoint(path),
                None,
                Some(&body),
                &[("Content-Type", "application/json")],
            )
            .await?;

        let response = raw.response;
        if response.result != "SUCCESS" {
            let code = map_error_code(&response.code);
            warn!(
                provider = "kbzpay",
                method = method,
                code = %response.code,
                mapped = %code,
                "kbzpay rejected request"
            );
            return Err(PaymentError::provider("kbzpay", code, response.msg.clone()));
        }
        Ok(response)
    }
}

/// Map KBZPay response codes onto the shared taxonomy.
pub fn map_error_code(code: &str) -> ProviderErrorCode {
    match code {
        "AUTH_FAILED" | "INVALID_SIGN" | "INVALID_APPID" | "INVALID_MERCH_CODE" => {
            ProviderErrorCode::InvalidCredentials
        }
        "INVALID_AMOUNT" | "AMOUNT_LIMIT_EXCEEDED" => ProviderErrorCode::InvalidAmount,
        "INVALID_MSISDN" | "CUSTOMER_NOT_EXIST" => ProviderErrorCode::InvalidPhone,
        "BALANCE_NOT_ENOUGH" | "INSUFFICIENT_BALANCE" => ProviderErrorCode::InsufficientBalance,
        "ACCOUNT_FROZEN" | "ACCOUNT_LOCKED" | "CUSTOMER_BLOCKED" => {
            ProviderErrorCode::AccountBlocked
        }
        "SYSTEM_BUSY" | "SYSTEM_ERROR" | "SERVICE_UNAVAILABLE" => ProviderErrorCode::ProviderBusy,
        "ORDER_EXISTS" | "DUPLICATE_ORDER" => ProviderErrorCode::DuplicateOrder,
        "ORDER_NOT_EXIST" => ProviderErrorCode::OrderNotFound,
        _ => ProviderErrorCode::Unknown,
    }
}

fn map_trade_status(status: &str) -> ProviderStatus {
    match status {
        "PAY_SUCCESS" | "TRANSFER_SUCCESS" => ProviderStatus::Success,
        "PAY_FAILED" | "ORDER_CLOSED" | "ORDER_EXPIRED" | "TRANSFER_FAILED" => {
            ProviderStatus::Failed
        }
        _ => ProviderStatus::Pending,
    }
}

fn parse_amount(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    let integral = trimmed.split('.').next().unwrap_or(trimmed);
    integral.parse::<i64>().ok()
}

#[async_trait]
impl PaymentProvider for KbzPayProvider {
    async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
        let biz = json!({
            "merch_order_id": request.order_ref,
            "merch_code": self.credential.merchant_id,
            "appid": self.credential.app_id,
            "trade_type": "PAY_BY_QRCODE",
            "title": request.description.clone().unwrap_or_else(|| "Payment".to_string()),
            "total_amount": format_minor_units(request.amount, &request.currency),
            "trans_currency": request.currency,
            "timeout_express": "120m",
        });
        let response = self.call("/precreate", "kbz.payment.precreate", biz).await?;

        let provider_order_id = response
            .merch_order_id
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| request.order_ref.clone());
        let pay_action = match response.qr_code.clone() {
            Some(payload) if !payload.is_empty() => PayAction::QrCode { payload },
            _ => PayAction::Redirect {
                url: format!(
                    "{}?prepay_id={}",
                    self.credential.endpoint("/pwa/pay"),
                    response.prepay_id.clone().unwrap_or_default()
                ),
            },
        };
        info!(provider = "kbzpay", order_ref = %request.order_ref, "kbzpay deposit precreated");

        Ok(DepositResponse {
            provider_order_id,
            pay_action,
            provider_data: Some(json!({ "prepay_id": response.prepay_id })),
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
                    "recipient.phone_number is required for kbzpay withdrawals",
                    Some("recipient.phone_number"),
                )
            })?;
        let biz = json!({
            "merch_order_id": request.order_ref,
            "merch_code": self.credential.merchant_id,
            "appid": self.credential.app_id,
            "payee_msisdn": msisdn,
            "total_amount": format_minor_units(request.amount, &request.currency),
            "trans_currency": request.currency,
            "remark": request.reason.clone().unwrap_or_default(),
        });
        let response = self.call("/transfer", "kbz.payment.transfer", biz).await?;

        Ok(WithdrawalResponse {
            provider_order_id: response
                .merch_order_id
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or(request.order_ref),
            provider_data: Some(json!({ "mm_order_id": response.mm_order_id })),
        })
    }

    async fn query_status(&self, provider_order_id: &str) -> PaymentResult<StatusResponse> {
        let biz = json!({
            "merch_order_id": provider_order_id,
            "merch_code": self.credential.merchant_id,
            "appid": self.credential.app_id,
        });
        let response = self
            .call("/queryorder", "kbz.payment.queryorder", biz)
            .await?;
        let status = map_trade_status(response.trade_status.as_deref().unwrap_or(""));

        Ok(StatusResponse {
            status,
            amount: response.total_amount.as_deref().and_then(parse_amount),
            completed_at: response
                .pay_success_time
                .as_deref()
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            failure_reason: match status {
                ProviderStatus::Failed => response.trade_status.clone(),
                _ => None,
            },
        })
    }

    async fn cancel(&self, provider_order_id: &str) -> PaymentResult<()> {
        let biz = json!({
            "merch_order_id": provider_order_id,
            "merch_code": self.credential.merchant_id,
            "appid": self.credential.app_id,
        });
        self.call("/closeorder", "kbz.payment.closeorder", biz)
            .await?;
        Ok(())
    }

    fn name(&self) -> ProviderName {
        ProviderName::KbzPay
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["MMK"]
    }

    fn verify_webhook_signature(&self, payload: &[u8], _headers: &HeaderMap) -> bool {
        let parsed: JsonValue = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let request = parsed.get("Request").unwrap_or(&parsed);
        let provided = match request.get("sign").and_then(|v| v.as_str()) {
            Some(v) => v.to_uppercase(),
            None => return false,
        };
        let base = sorted_param_string(&json_params(request), SIGN_EXCLUDED);
        let expected =
            sha256_hex_upper(&format!("{}&key={}", base, self.credential.callback_secret()));
        secure_eq(expected.as_bytes(), provided.as_bytes())
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid kbzpay callback JSON: {}", e),
            }
        })?;
        let request = parsed.get("Request").cloned().unwrap_or(parsed.clone());
        let callback: KbzCallback = serde_json::from_value(request).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("malformed kbzpay callback: {}", e),
            }
        })?;

        let status = map_trade_status(&callback.trade_status);
        let event_id = format!(
            "{}:{}",
            callback
                .mm_order_id
                .clone()
                .unwrap_or_else(|| callback.merch_order_id.clone()),
            callback.trade_status
        );

        Ok(WebhookEvent {
            provider: ProviderName::KbzPay,
            event_id,
            provider_order_id: Some(callback.merch_order_id.clone()),
            order_ref: Some(callback.merch_order_id),
            status,
            amount: callback.total_amount.as_deref().and_then(parse_amount),
            occurred_at: callback
                .notify_time
                .as_deref()
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            failure_reason: match status {
                ProviderStatus::Failed => Some(callback.trade_status),
                _ => None,
            },
            payload: parsed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct KbzEnvelope {
    #[serde(rename = "Response")]
    response: KbzResponse,
}

#[derive(Debug, Deserialize)]
struct KbzResponse {
    result: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    merch_order_id: Option<String>,
    #[serde(default)]
    mm_order_id: Option<String>,
    #[serde(default)]
    prepay_id: Option<String>,
    #[serde(default, rename = "qrCode")]
    qr_code: Option<String>,
    #[serde(default)]
    trade_status: Option<String>,
    #[serde(default)]
    total_amount: Option<String>,
    #[serde(default)]
    pay_success_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KbzCallback {
    merch_order_id: String,
    #[serde(default)]
    mm_order_id: Option<String>,
    trade_status: String,
    #[serde(default)]
    total_amount: Option<String>,
    #[serde(default)]
    notify_time: Option<String>,
}
