use crate::payments::error::PaymentResult;
use crate::payments::providers::{AyaPayProvider, KbzPayProvider, WavePayProvider};
use crate::payments::types::{
    DepositRequest, DepositResponse, ProviderName, StatusResponse, WebhookEvent,
    WithdrawalRequest, WithdrawalResponse,
};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;

/// Contract every wallet adapter implements.
///
/// Adapters hold no transaction state between calls; everything durable
/// lives in the ledger. Each call is a single attempt, retries belong to
/// [`crate::payments::retry::RetryPolicy`].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse>;

    async fn create_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> PaymentResult<WithdrawalResponse>;

    async fn query_status(&self, provider_order_id: &str) -> PaymentResult<StatusResponse>;

    async fn cancel(&self, provider_order_id: &str) -> PaymentResult<()>;

    fn name(&self) -> ProviderName;

    fn supported_currencies(&self) -> &'static [&'static str];

    fn verify_webhook_signature(&self, payload: &[u8], headers: &HeaderMap) -> bool;

    fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent>;
}

/// The closed set of adapters resolved from configuration at start-up.
///
/// `Custom` carries an adapter supplied by the embedding application, and
/// is how tests plug in scripted providers.
#[derive(Clone)]
pub enum Provider {
    KbzPay(Arc<KbzPayProvider>),
    WavePay(Arc<WavePayProvider>),
    AyaPay(Arc<AyaPayProvider>),
    Custom(Arc<dyn PaymentProvider>),
}

impl Provider {
    fn adapter(&self) -> &dyn PaymentProvider {
        match self {
            Provider::KbzPay(p) => p.as_ref(),
            Provider::WavePay(p) => p.as_ref(),
            Provider::AyaPay(p) => p.as_ref(),
            Provider::Custom(p) => p.as_ref(),
        }
    }

    pub fn name(&self) -> ProviderName {
        self.adapter().name()
    }

    pub fn supports_currency(&self, currency: &str) -> bool {
        self.adapter()
            .supported_currencies()
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }

    pub async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
        self.adapter().create_deposit(request).await
    }

    pub async fn create_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> PaymentResult<WithdrawalResponse> {
        self.adapter().create_withdrawal(request).await
    }

    pub async fn query_status(&self, provider_order_id: &str) -> PaymentResult<StatusResponse> {
        self.adapter().query_status(provider_order_id).await
    }

    pub async fn cancel(&self, provider_order_id: &str) -> PaymentResult<()> {
        self.adapter().cancel(provider_order_id).await
    }

    pub fn verify_webhook_signature(&self, payload: &[u8], headers: &HeaderMap) -> bool {
        self.adapter().verify_webhook_signature(payload, headers)
    }

    pub fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
        self.adapter().parse_webhook_event(payload)
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Provider({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{PayAction, ProviderStatus, RecipientInfo};

    struct MockProvider;

    #[async_trait]
    impl PaymentProvider for MockProvider {
        async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
            Ok(DepositResponse {
                provider_order_id: format!("mock-{}", request.order_ref),
                pay_action: PayAction::Redirect {
                    url: "https://example.com/pay".to_string(),
                },
                provider_data: None,
            })
        }

        async fn create_withdrawal(
            &self,
            request: WithdrawalRequest,
        ) -> PaymentResult<WithdrawalResponse> {
            Ok(WithdrawalResponse {
                provider_order_id: format!("mock-wd-{}", request.order_ref),
                provider_data: None,
            })
        }

        async fn query_status(&self, _provider_order_id: &str) -> PaymentResult<StatusResponse> {
            Ok(StatusResponse {
                status: ProviderStatus::Success,
                amount: Some(1000),
                completed_at: None,
                failure_reason: None,
            })
        }

        async fn cancel(&self, _provider_order_id: &str) -> PaymentResult<()> {
            Ok(())
        }

        fn name(&self) -> ProviderName {
            ProviderName::KbzPay
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["MMK"]
        }

        fn verify_webhook_signature(&self, _payload: &[u8], _headers: &HeaderMap) -> bool {
            true
        }

        fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Ok(WebhookEvent {
                provider: ProviderName::KbzPay,
                event_id: "evt".to_string(),
                provider_order_id: Some("mock-1".to_string()),
                order_ref: None,
                status: ProviderStatus::Success,
                amount: None,
                occurred_at: None,
                failure_reason: None,
                payload: serde_json::json!({}),
            })
        }
    }

    #[tokio::test]
    async fn custom_variant_dispatches_to_adapter() {
        let provider = Provider::Custom(Arc::new(MockProvider));
        assert_eq!(provider.name(), ProviderName::KbzPay);
        assert!(provider.supports_currency("mmk"));
        assert!(!provider.supports_currency("USD"));

        let response = provider
            .create_deposit(DepositRequest {
                amount: 1000,
                currency: "MMK".to_string(),
                order_ref: "txn_1".to_string(),
                recipient: RecipientInfo::default(),
                description: None,
            })
            .await
            .expect("deposit should succeed");
        assert_eq!(response.provider_order_id, "mock-txn_1");

        let status = provider.query_status("mock-txn_1").await.unwrap();
        assert_eq!(status.status, ProviderStatus::Success);
    }
}
