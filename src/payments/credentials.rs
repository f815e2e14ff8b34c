use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::{ProviderEnvironment, ProviderName};
use std::str::FromStr;

/// Merchant credentials for one wallet provider.
///
/// Loaded once at process start; rotating secrets requires a restart.
#[derive(Clone)]
pub struct ProviderCredential {
    pub provider: ProviderName,
    pub merchant_id: String,
    /// App id / API key, depending on what the provider calls it.
    pub app_id: String,
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub base_url: String,
    pub environment: ProviderEnvironment,
    pub timeout_secs: u64,
    pub notify_url: Option<String>,
}

impl std::fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("provider", &self.provider)
            .field("merchant_id", &self.merchant_id)
            .field("app_id", &self.app_id)
            .field("secret_key", &"***")
            .field("base_url", &self.base_url)
            .field("environment", &self.environment)
            .finish()
    }
}

pub fn default_base_url(provider: ProviderName, environment: ProviderEnvironment) -> &'static str {
    match (provider, environment) {
        (ProviderName::KbzPay, ProviderEnvironment::Sandbox) => {
            "https://uat-miniapp.kbzpay.com/payment/gateway/uat"
        }
        (ProviderName::KbzPay, ProviderEnvironment::Production) => {
            "https://api.kbzpay.com/payment/gateway"
        }
        (ProviderName::WavePay, ProviderEnvironment::Sandbox) => {
            "https://testpayments.wavemoney.io:8107"
        }
        (ProviderName::WavePay, ProviderEnvironment::Production) => {
            "https://payments.wavemoney.io"
        }
        (ProviderName::AyaPay, ProviderEnvironment::Sandbox) => {
            "https://opensandbox.ayainnovation.com"
        }
        (ProviderName::AyaPay, ProviderEnvironment::Production) => {
            "https://api.ayainnovation.com"
        }
    }
}

impl ProviderCredential {
    pub fn from_env(provider: ProviderName) -> PaymentResult<Self> {
        let prefix = provider.env_prefix();
        let required = |suffix: &str| -> PaymentResult<String> {
            let key = format!("{}_{}", prefix, suffix);
            std::env::var(&key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(PaymentError::ValidationError {
                    message: format!("{} environment variable is required", key),
                    field: Some(key),
                })
        };
        let optional = |suffix: &str| -> Option<String> {
            std::env::var(format!("{}_{}", prefix, suffix))
                .ok()
                .filter(|v| !v.trim().is_empty())
        };

        let environment = match optional("ENVIRONMENT") {
            Some(value) => ProviderEnvironment::from_str(&value)?,
            None => ProviderEnvironment::Sandbox,
        };

        Ok(Self {
            provider,
            merchant_id: required("MERCHANT_ID")?,
            app_id: optional("APP_ID")
                .or_else(|| optional("API_KEY"))
                .unwrap_or_default(),
            secret_key: required("SECRET_KEY")?,
            webhook_secret: optional("WEBHOOK_SECRET"),
            base_url: optional("BASE_URL")
                .unwrap_or_else(|| default_base_url(provider, environment).to_string()),
            environment,
            timeout_secs: optional("TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            notify_url: optional("NOTIFY_URL"),
        })
    }

    /// Secret used to authenticate inbound callbacks.
    pub fn callback_secret(&self) -> &str {
        self.webhook_secret.as_deref().unwrap_or(&self.secret_key)
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secret() {
        let credential = ProviderCredential {
            provider: ProviderName::KbzPay,
            merchant_id: "M12345".to_string(),
            app_id: "kp1".to_string(),
            secret_key: "super-secret".to_string(),
            webhook_secret: None,
            base_url: "https://example.com/".to_string(),
            environment: ProviderEnvironment::Sandbox,
            timeout_secs: 5,
            notify_url: None,
        };
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("super-secret"));
        assert_eq!(credential.callback_secret(), "super-secret");
        assert_eq!(credential.endpoint("/precreate"), "https://example.com/precreate");
    }

    #[test]
    fn default_urls_depend_on_environment() {
        assert_ne!(
            default_base_url(ProviderName::WavePay, ProviderEnvironment::Sandbox),
            default_base_url(ProviderName::WavePay, ProviderEnvironment::Production)
        );
    }
}
