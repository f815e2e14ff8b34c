use crate::payments::credentials::ProviderCredential;
use crate::payments::error::{PaymentError, PaymentResult, ProviderErrorCode};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    format_minor_units, DepositRequest, DepositResponse, PayAction, ProviderName, ProviderStatus,
    StatusResponse, WebhookEvent, WithdrawalRequest, WithdrawalResponse,
};
use crate::payments::utils::{
    header_value, json_params, md5_hex, sorted_param_string, verify_hmac_sha256_hex,
    PaymentHttpClient,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{info, warn};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// AYA Pay merchant API adapter.
///
/// Outbound calls carry `X-Signature`, an MD5 over the sorted request
/// parameters with `&secret=` appended. Callbacks are signed with
/// HMAC-SHA256 over the raw body.
pub struct AyaPayProvider {
    credential: ProviderCredential,
    http: PaymentHttpClient,
}

impl AyaPayProvider {
    pub fn new(credential: ProviderCredential) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new("ayapay", Duration::from_secs(credential.timeout_secs))?;
        Ok(Self { credential, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(ProviderCredential::from_env(ProviderName::AyaPay)?)
    }

    pub fn request_signature(&self, body: &JsonValue) -> String {
        let base = sorted_param_string(&json_params(body), &[]);
        md5_hex(&format!("{}&secret={}", base, self.credential.secret_key))
    }

    async fn post(&self, path: &str, body: JsonValue) -> PaymentResult<AyaData> {
        let signature = self.request_signature(&body);
        let raw: AyaEnvelope = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.credential.endpoint(path),
                Some(&self.credential.app_id),
                Some(&body),
                &[
                    ("Content-Type", "application/json"),
                    ("X-Signature", signature.as_str()),
                ],
            )
            .await?;

        if raw.err != 200 {
            let code = map_error_code(raw.code.as_deref().unwrap_or(""), raw.err);
            warn!(
                provider = "ayapay",
                path = path,
                err = raw.err,
                mapped = %code,
                "ayapay rejected request"
            );
            return Err(PaymentError::provider("ayapay", code, raw.message));
        }
        Ok(raw.data.unwrap_or_default())
    }
}

pub fn map_error_code(code: &str, err: i64) -> ProviderErrorCode {
    match code.trim().to_uppercase().as_str() {
        "INVALID_AMOUNT" => ProviderErrorCode::InvalidAmount,
        "INVALID_PHONE" | "CUSTOMER_NOT_FOUND" => ProviderErrorCode::InvalidPhone,
        "INSUFFICIENT_BALANCE" => ProviderErrorCode::InsufficientBalance,
        "ACCOUNT_BLOCKED" | "CUSTOMER_SUSPENDED" => ProviderErrorCode::AccountBlocked,
        "INVALID_SIGNATURE" | "INVALID_TOKEN" => ProviderErrorCode::InvalidCredentials,
        "DUPLICATE_TRANSACTION" => ProviderErrorCode::DuplicateOrder,
        "TRANSACTION_NOT_FOUND" => ProviderErrorCode::OrderNotFound,
        "SYSTEM_BUSY" => ProviderErrorCode::ProviderBusy,
        _ => match err {
            401 | 403 => ProviderErrorCode::InvalidCredentials,
            404 => ProviderErrorCode::OrderNotFound,
            503 => ProviderErrorCode::ProviderBusy,
            _ => ProviderErrorCode::Unknown,
        },
    }
}

fn map_status(status: &str) -> ProviderStatus {
    match status.trim().to_uppercase().as_str() {
        "SUCCESS" | "PAID" | "COMPLETED" => ProviderStatus::Success,
        "FAILED" | "REJECTED" | "EXPIRED" | "CANCELLED" => ProviderStatus::Failed,
        _ => ProviderStatus::Pending,
    }
}

fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        JsonValue::String(s) => s
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        _ => None,
    }
}

fn parse_amount(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.split('.').next().and_then(|v| v.parse().ok()),
        _ => None,
    }
}

#[async_trait]
impl PaymentProvider for AyaPayProvider {
    async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
        let phone = request
            .recipient
            .phone_number
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::validation(
                    "recipient.phone_number is required for ayapay push payments",
                    Some("recipient.phone_number"),
                )
            })?;
        let body = json!({
            "merchantId": self.credential.merchant_id,
            "customerPhone": phone,
            "amount": format_minor_units(request.amount, &request.currency),
            "currency": request.currency,
            "externalTransactionId": request.order_ref,
            "externalAdditionalData": request.description.clone().unwrap_or_default(),
            "callbackUrl": self.credential.notify_url.clone().unwrap_or_default(),
        });
        let data = self
            .post("/api/v1/merchant/requestPushPayment", body)
            .await?;

        let reference = data.reference_number.clone().ok_or_else(|| {
            PaymentError::provider(
                "ayapay",
                ProviderErrorCode::Unknown,
                "ayapay response is missing referenceNumber",
            )
        })?;
        let pay_action = match data.qr_data.clone() {
            Some(payload) if !payload.is_empty() => PayAction::QrCode { payload },
            _ => PayAction::Redirect {
                url: format!("ayapay://payment?referenceNumber={}", reference),
            },
        };
        info!(provider = "ayapay", order_ref = %request.order_ref, "ayapay push payment requested");

        Ok(DepositResponse {
            provider_order_id: reference,
            pay_action,
            provider_data: None,
        })
    }

    async fn create_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> PaymentResult<WithdrawalResponse> {
        let phone = request
            .recipient
            .phone_number
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                PaymentError::validation(
                    "recipient.phone_number is required for ayapay withdrawals",
                    Some("recipient.phone_number"),
                )
            })?;
        let body = json!({
            "merchantId": self.credential.merchant_id,
            "receiverPhone": phone,
            "amount": format_minor_units(request.amount, &request.currency),
            "currency": request.currency,
            "externalTransactionId": request.order_ref,
            "remark": request.reason.clone().unwrap_or_default(),
        });
        let data = self.post("/api/v1/merchant/disbursement", body).await?;

        Ok(WithdrawalResponse {
            provider_order_id: data.reference_number.unwrap_or(request.order_ref),
            provider_data: None,
        })
    }

    async fn query_status(&self, provider_order_id: &str) -> PaymentResult<StatusResponse> {
        let body = json!({
            "merchantId": self.credential.merchant_id,
            "referenceNumber": provider_order_id,
        });
        let data = self
            .post("/api/v1/merchant/checkRequestPayment", body)
            .await?;
        let status = map_status(data.status.as_deref().unwrap_or(""));

        Ok(StatusResponse {
            status,
            amount: data.amount.as_ref().and_then(parse_amount),
            completed_at: data.transaction_date.as_ref().and_then(parse_timestamp),
            failure_reason: match status {
                ProviderStatus::Failed => data.status.clone(),
                _ => None,
            },
        })
    }

    async fn cancel(&self, provider_order_id: &str) -> PaymentResult<()> {
        let body = json!({
            "merchantId": self.credential.merchant_id,
            "referenceNumber": provider_order_id,
        });
        self.post("/api/v1/merchant/cancelPayment", body).await?;
        Ok(())
    }

    fn name(&self) -> ProviderName {
        ProviderName::AyaPay
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["MMK"]
    }

    fn verify_webhook_signature(&self, payload: &[u8], headers: &HeaderMap) -> bool {
        match header_value(headers, SIGNATURE_HEADER) {
            Some(signature) => {
                verify_hmac_sha256_hex(payload, self.credential.callback_secret(), signature)
            }
            None => false,
        }
    }

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        let parsed: JsonValue = serde_json::from_slice(payload).map_err(|e| {
            PaymentError::WebhookVerificationError {
                message: format!("invalid ayapay callback JSON: {}", e),
            }
        })?;
        let body = parsed.get("paymentResult").unwrap_or(&parsed);
        let text = |key: &str| body.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let reference = text("referenceNumber");
        let external = text("externalTransactionId");
        if reference.is_none() && external.is_none() {
            return Err(PaymentError::WebhookVerificationError {
                message: "ayapay callback carries no transaction reference".to_string(),
            });
        }
        let status_raw = text("status").unwrap_or_default();
        let status = map_status(&status_raw);
        let event_id = parsed
            .get("eventId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{}:{}",
                    reference.clone().or_else(|| external.clone()).unwrap_or_default(),
                    status_raw
                )
            });

        Ok(WebhookEvent {
            provider: ProviderName::AyaPay,
            event_id,
            provider_order_id: reference,
            order_ref: external,
            status,
            amount: body.get("amount").and_then(parse_amount),
            occurred_at: body
                .get("timestamp")
                .or_else(|| body.get("transactionDate"))
                .and_then(parse_timestamp),
            failure_reason: match status {
                ProviderStatus::Failed => Some(status_raw),
                _ => None,
            },
            payload: parsed.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AyaEnvelope {
    err: i64,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<AyaData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AyaData {
    #[serde(default)]
    reference_number: Option<String>,
    #[serde(default)]
    qr_data: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<JsonValue>,
    #[serde(default)]
    transaction_date: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::ProviderEnvironment;
    use crate::payments::utils::hmac_sha256_hex;
    use http::HeaderValue;

    fn provider() -> AyaPayProvider {
        AyaPayProvider::new(ProviderCredential {
            provider: ProviderName::AyaPay,
            merchant_id: "aya_m1".to_string(),
            app_id: "aya_key".to_string(),
            secret_key: "aya_secret".to_string(),
            webhook_secret: Some("aya_webhook".to_string()),
            base_url: "https://aya.example.com".to_string(),
            environment: ProviderEnvironment::Sandbox,
            timeout_secs: 5,
            notify_url: None,
        })
        .expect("provider init should succeed")
    }

    #[test]
    fn request_signature_is_md5_over_sorted_params() {
        let provider = provider();
        let body = json!({"b": "2", "a": "1"});
        assert_eq!(
            provider.request_signature(&body),
            md5_hex("a=1&b=2&secret=aya_secret")
        );
    }

    #[test]
    fn webhook_requires_matching_hmac_header() {
        let provider = provider();
        let payload = br#"{"referenceNumber":"AYA1","status":"SUCCESS","amount":"2500","timestamp":1700000000}"#;
        let mut headers = HeaderMap::new();
        assert!(!provider.verify_webhook_signature(payload, &headers));

        let signature = hmac_sha256_hex("aya_webhook", payload);
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        assert!(provider.verify_webhook_signature(payload, &headers));

        let wrong = hmac_sha256_hex("aya_secret", payload);
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&wrong).unwrap());
        assert!(!provider.verify_webhook_signature(payload, &headers));
    }

    #[test]
    fn webhook_parses_nested_and_flat_bodies() {
        let provider = provider();
        let flat = br#"{"referenceNumber":"AYA1","externalTransactionId":"txn_7","status":"SUCCESS","amount":2500,"timestamp":1700000000}"#;
        let event = provider.parse_webhook_event(flat).unwrap();
        assert_eq!(event.status, ProviderStatus::Success);
        assert_eq!(event.amount, Some(2500));
        assert_eq!(event.order_ref.as_deref(), Some("txn_7"));
        assert_eq!(event.event_id, "AYA1:SUCCESS");

        let nested = br#"{"paymentResult":{"referenceNumber":"AYA2","status":"FAILED"},"eventId":"e1"}"#;
        let event = provider.parse_webhook_event(nested).unwrap();
        assert_eq!(event.status, ProviderStatus::Failed);
        assert_eq!(event.provider_order_id.as_deref(), Some("AYA2"));
        assert_eq!(event.event_id, "e1");

        assert!(provider.parse_webhook_event(br#"{"status":"SUCCESS"}"#).is_err());
    }

    #[test]
    fn error_mapping_falls_back_to_http_style_codes() {
        assert_eq!(
            map_error_code("INSUFFICIENT_BALANCE", 400),
            ProviderErrorCode::InsufficientBalance
        );
        assert_eq!(map_error_code("", 503), ProviderErrorCode::ProviderBusy);
        assert_eq!(map_error_code("", 500), ProviderErrorCode::Unknown);
    }
}
