//! Application error type for the HTTP surface.
//!
//! Library layers return their own `thiserror` enums; handlers convert them
//! into [`AppError`], which knows its HTTP status, machine-readable code and
//! the message shown to clients.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Domain errors (4xx)
    TransactionNotFound,
    InvalidStateTransition,
    IdempotencyKeyInProgress,
    DispatchInFlight,
    InsufficientBalance,

    // Validation (400)
    ValidationError,
    InvalidAmount,
    InvalidCurrency,
    InvalidProvider,

    // Infrastructure errors (5xx)
    DatabaseError,
    CacheError,
    ConfigurationError,

    // External errors (502, 503, 504)
    PaymentProviderError,
    ProviderUnavailable,
    ExternalServiceTimeout,

    InternalError,
}

#[derive(Debug, Clone)]
pub enum DomainError {
    TransactionNotFound {
        transaction_id: String,
    },
    InvalidStateTransition {
        transaction_id: String,
        from: String,
        to: String,
    },
    /// Another request with this key is still being written.
    IdempotencyKeyInProgress {
        key: String,
    },
    /// The provider call is out and its reply has not been recorded.
    DispatchInFlight {
        transaction_id: String,
    },
    InsufficientBalance {
        available: i64,
        required: i64,
    },
}

#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Cache { message: String },
    Configuration { message: String },
    Internal { message: String },
}

#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// No adapter configured under this name.
    ProviderUnavailable { provider: String },
    Timeout { service: String, timeout_secs: u64 },
}

#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidAmount { amount: String, reason: String },
    InvalidCurrency { currency: String, reason: String },
    InvalidProvider { provider: String, reason: String },
    MissingField { field: String },
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    pub fn not_found(transaction_id: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::TransactionNotFound {
            transaction_id: transaction_id.into(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::InvalidStateTransition { .. } => 409,
                DomainError::IdempotencyKeyInProgress { .. } => 409,
                DomainError::DispatchInFlight { .. } => 409,
                DomainError::InsufficientBalance { .. } => 422,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502,
                ExternalError::ProviderUnavailable { .. } => 503,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
                DomainError::IdempotencyKeyInProgress { .. } => {
                    ErrorCode::IdempotencyKeyInProgress
                }
                DomainError::DispatchInFlight { .. } => ErrorCode::DispatchInFlight,
                DomainError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::ProviderUnavailable { .. } => ErrorCode::ProviderUnavailable,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
                ValidationError::InvalidCurrency { .. } => ErrorCode::InvalidCurrency,
                ValidationError::InvalidProvider { .. } => ErrorCode::InvalidProvider,
                ValidationError::MissingField { .. } | ValidationError::InvalidField { .. } => {
                    ErrorCode::ValidationError
                }
            },
        }
    }

    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Transaction '{}' not found", transaction_id)
                }
                DomainError::InvalidStateTransition {
                    transaction_id,
                    from,
                    to,
                } => format!(
                    "Transaction '{}' cannot move from {} to {}",
                    transaction_id, from, to
                ),
                DomainError::IdempotencyKeyInProgress { key } => format!(
                    "A request with idempotency key '{}' is still being processed",
                    key
                ),
                DomainError::DispatchInFlight { transaction_id } => format!(
                    "Transaction '{}' is waiting on the provider and cannot be cancelled yet",
                    transaction_id
                ),
                DomainError::InsufficientBalance {
                    available,
                    required,
                } => format!(
                    "Insufficient balance. Available: {}, Required: {}",
                    available, required
                ),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        format!("Payment provider ({}) rejected the request", provider)
                    }
                }
                ExternalError::ProviderUnavailable { provider } => {
                    format!("Payment provider '{}' is not available", provider)
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
                ValidationError::InvalidProvider { provider, reason } => {
                    format!("Invalid provider '{}': {}", provider, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => {
                matches!(
                    err,
                    DomainError::IdempotencyKeyInProgress { .. }
                        | DomainError::DispatchInFlight { .. }
                )
            }
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::ProviderUnavailable { .. } => false,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }

    /// Field-level details for validation failures.
    pub fn details(&self) -> Option<serde_json::Value> {
        match &self.kind {
            AppErrorKind::Validation(ValidationError::InvalidField { field, reason }) => {
                Some(serde_json::json!({ "field": field, "error": reason }))
            }
            AppErrorKind::Validation(ValidationError::MissingField { field }) => {
                Some(serde_json::json!({ "field": field }))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{} ({})", self.user_message(), context),
            None => write!(f, "{}", self.user_message()),
        }
    }
}

impl std::error::Error for AppError {}

impl From<crate::database::error::DatabaseError> for AppError {
    fn from(err: crate::database::error::DatabaseError) -> Self {
        if err.is_not_found() {
            if let crate::database::error::DatabaseErrorKind::NotFound { id, .. } = &err.kind {
                return AppError::not_found(id.clone());
            }
        }
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable: err.is_retryable(),
        }))
        .with_context(err.to_string())
    }
}

impl From<crate::payments::error::PaymentError> for AppError {
    fn from(err: crate::payments::error::PaymentError) -> Self {
        use crate::payments::error::PaymentError as PE;

        let kind = match &err {
            PE::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.clone().unwrap_or_else(|| "request".to_string()),
                    reason: message.clone(),
                })
            }
            PE::ProviderError { provider, .. } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: provider.clone(),
                    message: err.to_string(),
                    is_retryable: err.is_retryable(),
                })
            }
            PE::NetworkError { .. } | PE::RateLimitError { .. } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: "unknown".to_string(),
                    message: err.to_string(),
                    is_retryable: true,
                })
            }
            PE::WebhookVerificationError { message } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "signature".to_string(),
                    reason: message.clone(),
                })
            }
        };
        AppError::new(kind)
    }
}

impl From<crate::qr::QrError> for AppError {
    fn from(err: crate::qr::QrError) -> Self {
        use crate::qr::QrError;

        let kind = match &err {
            QrError::InvalidAmount(amount) => AppErrorKind::Validation(ValidationError::InvalidAmount {
                amount: amount.clone(),
                reason: err.to_string(),
            }),
            QrError::UnsupportedCurrency(currency) => {
                AppErrorKind::Validation(ValidationError::InvalidCurrency {
                    currency: currency.clone(),
                    reason: "no ISO 4217 numeric code known".to_string(),
                })
            }
            _ => AppErrorKind::Validation(ValidationError::InvalidField {
                field: "qr".to_string(),
                reason: err.to_string(),
            }),
        };
        AppError::new(kind)
    }
}
