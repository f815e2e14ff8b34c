use crate::payments::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    #[serde(rename = "kbzpay")]
    KbzPay,
    #[serde(rename = "wavepay")]
    WavePay,
    #[serde(rename = "ayapay")]
    AyaPay,
}

impl ProviderName {
    pub const ALL: [ProviderName; 3] = [ProviderName::KbzPay, ProviderName::WavePay, ProviderName::AyaPay];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::KbzPay => "kbzpay",
            ProviderName::WavePay => "wavepay",
            ProviderName::AyaPay => "ayapay",
        }
    }

    /// Prefix used for this provider's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ProviderName::KbzPay => "KBZPAY",
            ProviderName::WavePay => "WAVEPAY",
            ProviderName::AyaPay => "AYAPAY",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "kbzpay" | "kbz" | "kbz-pay" | "kbz_pay" => Ok(ProviderName::KbzPay),
            "wavepay" | "wave" | "wave-pay" | "wave_money" => Ok(ProviderName::WavePay),
            "ayapay" | "aya" | "aya-pay" | "aya_pay" => Ok(ProviderName::AyaPay),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEnvironment {
    Sandbox,
    Production,
}

impl FromStr for ProviderEnvironment {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sandbox" | "uat" | "test" => Ok(ProviderEnvironment::Sandbox),
            "production" | "prod" | "live" => Ok(ProviderEnvironment::Production),
            _ => Err(PaymentError::validation(
                format!("unknown provider environment: {}", value),
                Some("environment"),
            )),
        }
    }
}

/// ISO 4217 facts needed for amount formatting and QR payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyInfo {
    pub code: &'static str,
    pub numeric: &'static str,
    pub precision: u32,
}

const CURRENCIES: &[CurrencyInfo] = &[
    CurrencyInfo { code: "MMK", numeric: "104", precision: 0 },
    CurrencyInfo { code: "USD", numeric: "840", precision: 2 },
    CurrencyInfo { code: "THB", numeric: "764", precision: 2 },
    CurrencyInfo { code: "SGD", numeric: "702", precision: 2 },
];

pub fn currency_info(code: &str) -> Option<CurrencyInfo> {
    let normalized = code.trim().to_uppercase();
    CURRENCIES.iter().copied().find(|c| c.code == normalized)
}

/// Render an amount held in minor units as a provider-facing decimal string.
pub fn format_minor_units(amount: i64, currency: &str) -> String {
    let precision = currency_info(currency).map(|c| c.precision).unwrap_or(0);
    if precision == 0 {
        return amount.to_string();
    }
    let divisor = 10_i64.pow(precision);
    format!(
        "{}.{:0width$}",
        amount / divisor,
        (amount % divisor).abs(),
        width = precision as usize
    )
}

/// Destination or payer details, shaped per provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
}

/// What the payer has to do to complete a deposit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayAction {
    Redirect { url: String },
    QrCode { payload: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    /// Our transaction id, sent to the provider as its merchant order
    /// reference so the provider can dedupe on its side.
    pub order_ref: String,
    pub recipient: RecipientInfo,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub provider_order_id: String,
    pub pay_action: PayAction,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: i64,
    pub currency: String,
    pub order_ref: String,
    pub recipient: RecipientInfo,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalResponse {
    pub provider_order_id: String,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ProviderStatus,
    pub amount: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// A provider callback after signature verification and parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: ProviderName,
    /// Stable id of this delivery's event, used for duplicate detection.
    pub event_id: String,
    pub provider_order_id: Option<String>,
    pub order_ref: Option<String>,
    pub status: ProviderStatus,
    pub amount: Option<i64>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub payload: JsonValue,
}
