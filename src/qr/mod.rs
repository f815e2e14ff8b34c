//! Merchant-presented QR payloads (EMVCo layout).
//!
//! A payload is a run of TLV fields in fixed tag order, closed by tag `63`
//! carrying a CRC16-CCITT over everything before it, including the `6304`
//! header itself.

pub mod crc;
pub mod tlv;

use crate::payments::types::{currency_info, ProviderName};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tlv::{emit, find, TlvField};
use tracing::warn;

const TAG_PAYLOAD_FORMAT: &str = "00";
const TAG_POINT_OF_INITIATION: &str = "01";
const FIRST_ACCOUNT_TAG: u8 = 26;
const LAST_ACCOUNT_TAG: u8 = 51;
const TAG_MCC: &str = "52";
const TAG_CURRENCY: &str = "53";
const TAG_AMOUNT: &str = "54";
const TAG_COUNTRY: &str = "58";
const TAG_MERCHANT_NAME: &str = "59";
const TAG_MERCHANT_CITY: &str = "60";
const TAG_ADDITIONAL_DATA: &str = "62";
const TAG_CRC: &str = "63";

const SUB_TAG_GUID: &str = "00";
const SUB_TAG_MERCHANT_ID: &str = "01";
const SUB_TAG_BILL_NUMBER: &str = "01";
const SUB_TAG_REFERENCE_LABEL: &str = "05";

const MAX_MERCHANT_NAME: usize = 25;
const MAX_MERCHANT_CITY: usize = 15;
const MAX_ADDITIONAL_VALUE: usize = 25;
const MAX_AMOUNT_LEN: usize = 13;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QrError {
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid length {raw:?} for tag {tag}")]
    InvalidLength { tag: String, raw: String },

    #[error("value for tag {tag} is {len} characters, limit is 99")]
    ValueTooLong { tag: String, len: usize },

    #[error("payload truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("invalid field {field}: {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointOfInitiation {
    /// Reusable code, payer enters the amount.
    Static,
    /// Single-use code with the amount embedded.
    Dynamic,
}

impl PointOfInitiation {
    fn code(&self) -> &'static str {
        match self {
            PointOfInitiation::Static => "11",
            PointOfInitiation::Dynamic => "12",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantAccount {
    pub guid: String,
    pub merchant_id: String,
}

impl MerchantAccount {
    pub fn for_provider(provider: ProviderName, merchant_id: impl Into<String>) -> Self {
        Self {
            guid: provider_guid(provider).to_string(),
            merchant_id: merchant_id.into(),
        }
    }
}

/// Application identifier embedded in a provider's merchant account template.
pub fn provider_guid(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::KbzPay => "mm.com.kbzpay",
        ProviderName::WavePay => "mm.com.wavemoney",
        ProviderName::AyaPay => "mm.com.ayapay",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrPaymentRequest {
    /// One entry gives a single-provider code, several give a unified code.
    pub accounts: Vec<MerchantAccount>,
    /// Decimal major units, e.g. `"150000.00"`. `None` produces a static code.
    pub amount: Option<String>,
    pub currency: String,
    pub merchant_name: String,
    pub merchant_city: String,
    #[serde(default)]
    pub merchant_category_code: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub bill_number: Option<String>,
    #[serde(default)]
    pub reference_label: Option<String>,
}

/// A field shortened to fit its maximum length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncatedField {
    pub field: &'static str,
    pub original_length: usize,
    pub max_length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncodedQr {
    pub payload: String,
    pub truncated: Vec<TruncatedField>,
}

impl EncodedQr {
    pub fn was_truncated(&self) -> bool {
        !self.truncated.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedQr {
    pub point_of_initiation: PointOfInitiation,
    pub accounts: Vec<MerchantAccount>,
    pub merchant_category_code: Option<String>,
    pub currency_numeric: Option<String>,
    pub currency: Option<String>,
    pub amount: Option<String>,
    pub country_code: Option<String>,
    pub merchant_name: Option<String>,
    pub merchant_city: Option<String>,
    pub bill_number: Option<String>,
    pub reference_label: Option<String>,
}

fn truncate(
    value: &str,
    max: usize,
    field: &'static str,
    truncated: &mut Vec<TruncatedField>,
) -> String {
    let len = value.chars().count();
    if len <= max {
        return value.to_string();
    }
    warn!(field = field, original_length = len, max_length = max, "qr field truncated");
    truncated.push(TruncatedField {
        field,
        original_length: len,
        max_length: max,
    });
    value.chars().take(max).collect()
}

/// Render `raw` with exactly the currency's precision. Non-zero digits beyond
/// that precision are rejected rather than rounded.
pub fn format_amount(raw: &str, precision: u32) -> Result<String, QrError> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
        || trimmed.matches('.').count() > 1
    {
        return Err(QrError::InvalidAmount(raw.to_string()));
    }
    let value =
        BigDecimal::from_str(trimmed).map_err(|_| QrError::InvalidAmount(raw.to_string()))?;
    if value <= BigDecimal::from(0) {
        return Err(QrError::InvalidAmount(format!("{} must be positive", raw)));
    }
    let scaled = value.with_scale(i64::from(precision));
    if scaled != value {
        return Err(QrError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            raw, precision
        )));
    }

    let (digits, _) = scaled.as_bigint_and_exponent();
    let mut digits = digits.to_string();
    let precision = precision as usize;
    let rendered = if precision == 0 {
        digits
    } else {
        if digits.len() <= precision {
            digits = format!("{}{}", "0".repeat(precision + 1 - digits.len()), digits);
        }
        let split = digits.len() - precision;
        format!("{}.{}", &digits[..split], &digits[split..])
    };

    if rendered.len() > MAX_AMOUNT_LEN {
        return Err(QrError::InvalidAmount(format!("{} is too large", raw)));
    }
    Ok(rendered)
}

pub fn encode(request: &QrPaymentRequest) -> Result<EncodedQr, QrError> {
    let max_accounts = usize::from(LAST_ACCOUNT_TAG - FIRST_ACCOUNT_TAG) + 1;
    if request.accounts.is_empty() || request.accounts.len() > max_accounts {
        return Err(QrError::InvalidField {
            field: "accounts",
            message: format!("between 1 and {} merchant accounts required", max_accounts),
        });
    }
    let currency = currency_info(&request.currency)
        .ok_or_else(|| QrError::UnsupportedCurrency(request.currency.clone()))?;
    let mcc = request
        .merchant_category_code
        .clone()
        .unwrap_or_else(|| "0000".to_string());
    if mcc.len() != 4 || !mcc.bytes().all(|b| b.is_ascii_digit()) {
        return Err(QrError::InvalidField {
            field: "merchant_category_code",
            message: "must be four digits".to_string(),
        });
    }
    let country = request
        .country_code
        .clone()
        .unwrap_or_else(|| "MM".to_string())
        .to_uppercase();
    if country.len() != 2 {
        return Err(QrError::InvalidField {
            field: "country_code",
            message: "must be a two-letter code".to_string(),
        });
    }

    let mut truncated = Vec::new();
    let amount = request
        .amount
        .as_deref()
        .map(|raw| format_amount(raw, currency.precision))
        .transpose()?;
    let initiation = if amount.is_some() {
        PointOfInitiation::Dynamic
    } else {
        PointOfInitiation::Static
    };

    let mut payload = String::new();
    payload.push_str(&emit(TAG_PAYLOAD_FORMAT, "01")?);
    payload.push_str(&emit(TAG_POINT_OF_INITIATION, initiation.code())?);

    for (offset, account) in request.accounts.iter().enumerate() {
        if account.merchant_id.trim().is_empty() || account.guid.trim().is_empty() {
            return Err(QrError::InvalidField {
                field: "accounts",
                message: "guid and merchant_id are required".to_string(),
            });
        }
        let template = format!(
            "{}{}",
            emit(SUB_TAG_GUID, &account.guid)?,
            emit(SUB_TAG_MERCHANT_ID, &account.merchant_id)?
        );
        let tag = format!("{:02}", usize::from(FIRST_ACCOUNT_TAG) + offset);
        payload.push_str(&emit(&tag, &template)?);
    }

    payload.push_str(&emit(TAG_MCC, &mcc)?);
    payload.push_str(&emit(TAG_CURRENCY, currency.numeric)?);
    if let Some(amount) = &amount {
        payload.push_str(&emit(TAG_AMOUNT, amount)?);
    }
    payload.push_str(&emit(TAG_COUNTRY, &country)?);
    let name = truncate(
        &request.merchant_name,
        MAX_MERCHANT_NAME,
        "merchant_name",
        &mut truncated,
    );
    payload.push_str(&emit(TAG_MERCHANT_NAME, &name)?);
    let city = truncate(
        &request.merchant_city,
        MAX_MERCHANT_CITY,
        "merchant_city",
        &mut truncated,
    );
    payload.push_str(&emit(TAG_MERCHANT_CITY, &city)?);

    let mut additional = String::new();
    if let Some(bill) = request.bill_number.as_deref().filter(|v| !v.is_empty()) {
        let bill = truncate(bill, MAX_ADDITIONAL_VALUE, "bill_number", &mut truncated);
        additional.push_str(&emit(SUB_TAG_BILL_NUMBER, &bill)?);
    }
    if let Some(reference) = request.reference_label.as_deref().filter(|v| !v.is_empty()) {
        let reference = truncate(
            reference,
            MAX_ADDITIONAL_VALUE,
            "reference_label",
            &mut truncated,
        );
        additional.push_str(&emit(SUB_TAG_REFERENCE_LABEL, &reference)?);
    }
    if !additional.is_empty() {
        payload.push_str(&emit(TAG_ADDITIONAL_DATA, &additional)?);
    }

    payload.push_str(TAG_CRC);
    payload.push_str("04");
    let checksum = crc::crc16_hex(payload.as_bytes());
    payload.push_str(&checksum);

    Ok(EncodedQr { payload, truncated })
}

/// True when `payload` ends in a `6304` CRC field whose value matches the
/// checksum of everything before it.
pub fn validate_crc(payload: &str) -> bool {
    let len = payload.len();
    if len < 8 || !payload.is_char_boundary(len - 8) || !payload.is_char_boundary(len - 4) {
        return false;
    }
    let (body, checksum) = payload.split_at(len - 4);
    body.ends_with("6304") && crc::crc16_hex(body.as_bytes()) == checksum
}

pub fn decode(payload: &str) -> Result<DecodedQr, QrError> {
    if !validate_crc(payload) {
        return Err(QrError::ChecksumMismatch);
    }
    let fields = tlv::parse(payload)?;
    if fields.first().map(|f| (f.tag.as_str(), f.value.as_str())) != Some((TAG_PAYLOAD_FORMAT, "01"))
    {
        return Err(QrError::InvalidField {
            field: "payload_format_indicator",
            message: "first field must be 000201".to_string(),
        });
    }

    let point_of_initiation = match find(&fields, TAG_POINT_OF_INITIATION) {
        Some("12") => PointOfInitiation::Dynamic,
        _ => PointOfInitiation::Static,
    };

    let mut accounts = Vec::new();
    for field in &fields {
        let in_range = field
            .tag
            .parse::<u8>()
            .map(|t| (FIRST_ACCOUNT_TAG..=LAST_ACCOUNT_TAG).contains(&t))
            .unwrap_or(false);
        if !in_range {
            continue;
        }
        let nested = tlv::parse(&field.value)?;
        if let (Some(guid), Some(merchant_id)) = (
            find(&nested, SUB_TAG_GUID),
            find(&nested, SUB_TAG_MERCHANT_ID),
        ) {
            accounts.push(MerchantAccount {
                guid: guid.to_string(),
                merchant_id: merchant_id.to_string(),
            });
        }
    }

    let additional: Vec<TlvField> = match find(&fields, TAG_ADDITIONAL_DATA) {
        Some(value) => tlv::parse(value)?,
        None => Vec::new(),
    };
    let currency_numeric = find(&fields, TAG_CURRENCY).map(str::to_string);
    let currency = currency_numeric
        .as_deref()
        .and_then(|numeric| currency_code_for_numeric(numeric))
        .map(str::to_string);
    let owned = |tag: &str| find(&fields, tag).map(str::to_string);

    Ok(DecodedQr {
        point_of_initiation,
        accounts,
        merchant_category_code: owned(TAG_MCC),
        currency_numeric,
        currency,
        amount: owned(TAG_AMOUNT),
        country_code: owned(TAG_COUNTRY),
        merchant_name: owned(TAG_MERCHANT_NAME),
        merchant_city: owned(TAG_MERCHANT_CITY),
        bill_number: find(&additional, SUB_TAG_BILL_NUMBER).map(str::to_string),
        reference_label: find(&additional, SUB_TAG_REFERENCE_LABEL).map(str::to_string),
    })
}

fn currency_code_for_numeric(numeric: &str) -> Option<&'static str> {
    ["MMK", "USD", "THB", "SGD"]
        .into_iter()
        .find(|code| currency_info(code).map(|c| c.numeric) == Some(numeric))
}
