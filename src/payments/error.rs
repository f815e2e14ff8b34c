use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

/// Business error codes shared by every wallet adapter.
///
/// Each adapter maps its own response codes onto this set so that the
/// orchestrator can decide about retries without knowing the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorCode {
    InvalidAmount,
    InvalidPhone,
    InsufficientBalance,
    AccountBlocked,
    InvalidCredentials,
    ProviderBusy,
    DuplicateOrder,
    OrderNotFound,
    Unknown,
}

impl ProviderErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorCode::InvalidAmount => "INVALID_AMOUNT",
            ProviderErrorCode::InvalidPhone => "INVALID_PHONE",
            ProviderErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ProviderErrorCode::AccountBlocked => "ACCOUNT_BLOCKED",
            ProviderErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ProviderErrorCode::ProviderBusy => "PROVIDER_BUSY",
            ProviderErrorCode::DuplicateOrder => "DUPLICATE_ORDER",
            ProviderErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ProviderErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Only a busy provider is worth another attempt; every other business
    /// rejection will be returned again for the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderErrorCode::ProviderBusy)
    }
}

impl std::fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Webhook verification failed: {message}")]
    WebhookVerificationError { message: String },

    #[error("Provider error: provider={provider}, code={code}, message={message}")]
    ProviderError {
        provider: String,
        code: ProviderErrorCode,
        message: String,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn provider(provider: &str, code: ProviderErrorCode, message: impl Into<String>) -> Self {
        PaymentError::ProviderError {
            provider: provider.to_string(),
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        PaymentError::ValidationError {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::WebhookVerificationError { .. } => false,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    /// The provider already holds an order under this reference.
    pub fn is_duplicate_order(&self) -> bool {
        matches!(
            self,
            PaymentError::ProviderError {
                code: ProviderErrorCode::DuplicateOrder,
                ..
            }
        )
    }

    /// Short machine-readable reason stored on failed transactions.
    pub fn reason_code(&self) -> String {
        match self {
            PaymentError::ValidationError { .. } => "VALIDATION_ERROR".to_string(),
            PaymentError::NetworkError { .. } => "NETWORK_ERROR".to_string(),
            PaymentError::RateLimitError { .. } => "RATE_LIMITED".to_string(),
            PaymentError::WebhookVerificationError { .. } => {
                "SIGNATURE_VERIFICATION_FAILED".to_string()
            }
            PaymentError::ProviderError { code, .. } => code.as_str().to_string(),
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::WebhookVerificationError { .. } => {
                "Invalid webhook signature".to_string()
            }
            PaymentError::ProviderError { code, .. } => match code {
                ProviderErrorCode::InsufficientBalance => {
                    "Insufficient wallet balance to complete payment".to_string()
                }
                ProviderErrorCode::InvalidPhone => "Wallet phone number is invalid".to_string(),
                ProviderErrorCode::InvalidAmount => "Payment amount was rejected".to_string(),
                ProviderErrorCode::AccountBlocked => "Wallet account is blocked".to_string(),
                _ => "Payment provider returned an error".to_string(),
            },
        }
    }
}
