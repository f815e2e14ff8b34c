//! Inbound provider callbacks: authenticate, screen for replays, then hand
//! the parsed event to the orchestrator off the request path.

use crate::clock::SharedClock;
use crate::config::WebhookConfig;
use crate::payments::registry::ProviderRegistry;
use crate::payments::types::{ProviderName, WebhookEvent};
use crate::services::payment_orchestrator::{OrchestratorError, PaymentOrchestrator};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::HeaderMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Webhook source {peer:?} is not allowed for {provider}")]
    IpNotAllowed {
        provider: ProviderName,
        peer: Option<IpAddr>,
    },

    #[error("Invalid signature for {provider}")]
    InvalidSignature { provider: ProviderName },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Event timestamp {occurred_at} is outside the {window_secs}s window")]
    StaleTimestamp {
        occurred_at: DateTime<Utc>,
        window_secs: u64,
    },
}

impl WebhookError {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::UnknownProvider(_) => 404,
            WebhookError::IpNotAllowed { .. } => 403,
            WebhookError::InvalidSignature { .. } => 401,
            WebhookError::Malformed(_) | WebhookError::StaleTimestamp { .. } => 400,
        }
    }
}

/// Result of screening one delivery.
#[derive(Debug)]
pub enum Verified {
    /// First sighting; apply it.
    Fresh(WebhookEvent),
    /// Already accepted within the replay horizon; acknowledge only.
    Replay { event_id: String },
}

#[derive(Clone)]
pub struct WebhookProcessor {
    registry: ProviderRegistry,
    orchestrator: PaymentOrchestrator,
    config: Arc<WebhookConfig>,
    clock: SharedClock,
    accepted: Arc<DashMap<(ProviderName, String), DateTime<Utc>>>,
}

impl WebhookProcessor {
    pub fn new(orchestrator: PaymentOrchestrator, config: WebhookConfig) -> Self {
        Self {
            registry: orchestrator.registry().clone(),
            clock: orchestrator.clock().clone(),
            orchestrator,
            config: Arc::new(config),
            accepted: Arc::new(DashMap::new()),
        }
    }

    /// Authenticate and parse a delivery. Never touches the ledger.
    pub fn verify(
        &self,
        provider: &str,
        peer: Option<IpAddr>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Verified, WebhookError> {
        let name = ProviderName::from_str(provider)
            .map_err(|_| WebhookError::UnknownProvider(provider.to_string()))?;
        let adapter = self
            .registry
            .get(name)
            .ok_or_else(|| WebhookError::UnknownProvider(provider.to_string()))?;

        if !adapter.verify_webhook_signature(body, headers) {
            warn!(
                provider = %name,
                peer = ?peer,
                body_len = body.len(),
                "webhook signature verification failed"
            );
            return Err(WebhookError::InvalidSignature { provider: name });
        }

        let event = adapter
            .parse_webhook_event(body)
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        let now = self.clock.now();
        let window = self.config.replay_window();
        if let Some(occurred_at) = event.occurred_at {
            if (now - occurred_at).abs() > window {
                warn!(
                    provider = %name,
                    event_id = %event.event_id,
                    occurred_at = %occurred_at,
                    "webhook timestamp outside replay window"
                );
                return Err(WebhookError::StaleTimestamp {
                    occurred_at,
                    window_secs: self.config.replay_window_secs,
                });
            }
        }

        if !self.config.is_ip_allowed(name, peer) {
            warn!(provider = %name, peer = ?peer, "webhook from address outside allowlist");
            return Err(WebhookError::IpNotAllowed { provider: name, peer });
        }

        // Ids are kept for twice the window so that anything still inside
        // the timestamp check is also still remembered.
        let horizon = now - window * 2;
        self.accepted.retain(|_, seen_at| *seen_at > horizon);

        let key = (name, event.event_id.clone());
        let fresh = match self.accepted.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if !fresh {
            debug!(provider = %name, event_id = %event.event_id, "webhook redelivery acknowledged");
            return Ok(Verified::Replay {
                event_id: event.event_id,
            });
        }

        info!(
            provider = %name,
            event_id = %event.event_id,
            provider_order_id = ?event.provider_order_id,
            status = ?event.status,
            "webhook verified"
        );
        Ok(Verified::Fresh(event))
    }

    /// Apply a verified event in the background.
    pub fn dispatch(&self, event: WebhookEvent) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.apply(event).await })
    }

    pub async fn apply(&self, event: WebhookEvent) {
        let provider = event.provider;
        let event_id = event.event_id.clone();
        match self.orchestrator.apply_webhook_event(event).await {
            Ok((tx, outcome)) => debug!(
                provider = %provider,
                event_id = %event_id,
                transaction_id = %tx.id,
                outcome = ?outcome,
                "webhook processed"
            ),
            Err(e) => {
                // Let the provider's redelivery try again.
                self.forget(provider, &event_id);
                match e {
                    OrchestratorError::TransactionNotFound { .. } => warn!(
                        provider = %provider,
                        event_id = %event_id,
                        "webhook for unknown transaction"
                    ),
                    other => error!(
                        provider = %provider,
                        event_id = %event_id,
                        error = %other,
                        "webhook processing failed"
                    ),
                }
            }
        }
    }

    pub fn forget(&self, provider: ProviderName, event_id: &str) {
        self.accepted.remove(&(provider, event_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::idempotency::InMemoryIdempotencyStore;
    use crate::clock::{Clock, ManualClock};
    use crate::config::parse_allowlist;
    use crate::database::transaction_repository::InMemoryLedger;
    use crate::payments::error::{PaymentError, PaymentResult};
    use crate::payments::provider::{PaymentProvider, Provider};
    use crate::payments::types::{
        DepositRequest, DepositResponse, ProviderStatus, StatusResponse, WithdrawalRequest,
        WithdrawalResponse,
    };
    use crate::services::payment_orchestrator::OrchestratorConfig;
    use async_trait::async_trait;

    /// Accepts bodies carrying `sig: ok`; the body is the event JSON.
    struct HeaderSigned;

    #[async_trait]
    impl PaymentProvider for HeaderSigned {
        async fn create_deposit(&self, _r: DepositRequest) -> PaymentResult<DepositResponse> {
            Err(PaymentError::validation("unused", None))
        }

        async fn create_withdrawal(
            &self,
            _r: WithdrawalRequest,
        ) -> PaymentResult<WithdrawalResponse> {
            Err(PaymentError::validation("unused", None))
        }

        async fn query_status(&self, _id: &str) -> PaymentResult<StatusResponse> {
            Err(PaymentError::validation("unused", None))
        }

        async fn cancel(&self, _id: &str) -> PaymentResult<()> {
            Ok(())
        }

        fn name(&self) -> ProviderName {
            ProviderName::AyaPay
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["MMK"]
        }

        fn verify_webhook_signature(&self, _payload: &[u8], headers: &HeaderMap) -> bool {
            headers.get("sig").and_then(|v| v.to_str().ok()) == Some("ok")
        }

        fn parse_webhook_event(&self, payload: &[u8]) -> PaymentResult<WebhookEvent> {
            serde_json::from_slice(payload)
                .map_err(|e| PaymentError::validation(e.to_string(), None))
        }
    }

    fn processor(clock: ManualClock, config: WebhookConfig) -> WebhookProcessor {
        let registry = ProviderRegistry::new().with_provider(Provider::Custom(Arc::new(HeaderSigned)));
        let orchestrator = PaymentOrchestrator::new(
            registry,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryIdempotencyStore::new(
                chrono::Duration::hours(24),
                Arc::new(clock.clone()),
            )),
            OrchestratorConfig::default(),
        )
        .with_clock(Arc::new(clock));
        WebhookProcessor::new(orchestrator, config)
    }

    fn body(event_id: &str, occurred_at: DateTime<Utc>) -> Vec<u8> {
        serde_json::to_vec(&WebhookEvent {
            provider: ProviderName::AyaPay,
            event_id: event_id.to_string(),
            provider_order_id: Some("AYA-1".to_string()),
            order_ref: None,
            status: ProviderStatus::Success,
            amount: Some(1000),
            occurred_at: Some(occurred_at),
            failure_reason: None,
            payload: serde_json::json!({}),
        })
        .unwrap()
    }

    fn signed() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sig", "ok".parse().unwrap());
        headers
    }

    #[test]
    fn unknown_provider_is_not_found() {
        let clock = ManualClock::default();
        let processor = processor(clock.clone(), WebhookConfig::default());
        let err = processor
            .verify("paypal", None, &signed(), &body("e1", clock.now()))
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        // Valid name but no adapter configured.
        let err = processor
            .verify("kbzpay", None, &signed(), &body("e1", clock.now()))
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn bad_signature_is_unauthorized() {
        let clock = ManualClock::default();
        let processor = processor(clock.clone(), WebhookConfig::default());
        let err = processor
            .verify("ayapay", None, &HeaderMap::new(), &body("e1", clock.now()))
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature { .. }));
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn timestamp_outside_window_is_rejected() {
        let clock = ManualClock::default();
        let processor = processor(clock.clone(), WebhookConfig::default());
        let old = clock.now() - chrono::Duration::seconds(301);
        let err = processor
            .verify("ayapay", None, &signed(), &body("e1", old))
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let recent = clock.now() - chrono::Duration::seconds(299);
        assert!(processor
            .verify("ayapay", None, &signed(), &body("e2", recent))
            .is_ok());
    }

    #[test]
    fn redelivery_is_flagged_until_horizon_passes() {
        let clock = ManualClock::default();
        let processor = processor(clock.clone(), WebhookConfig::default());
        let payload = body("e1", clock.now());

        assert!(matches!(
            processor.verify("ayapay", None, &signed(), &payload),
            Ok(Verified::Fresh(_))
        ));
        assert!(matches!(
            processor.verify("ayapay", None, &signed(), &payload),
            Ok(Verified::Replay { .. })
        ));

        processor.forget(ProviderName::AyaPay, "e1");
        assert!(matches!(
            processor.verify("ayapay", None, &signed(), &payload),
            Ok(Verified::Fresh(_))
        ));
    }

    #[test]
    fn allowlist_is_enforced() {
        let clock = ManualClock::default();
        let mut config = WebhookConfig::default();
        config
            .allowed_ips
            .insert(ProviderName::AyaPay, parse_allowlist("10.0.0.0/8").unwrap());
        let processor = processor(clock.clone(), config);

        let outside: IpAddr = "192.0.2.10".parse().unwrap();
        let err = processor
            .verify("ayapay", Some(outside), &signed(), &body("e1", clock.now()))
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let inside: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(processor
            .verify("ayapay", Some(inside), &signed(), &body("e1", clock.now()))
            .is_ok());
    }

    #[test]
    fn signature_is_checked_before_the_allowlist() {
        let clock = ManualClock::default();
        let mut config = WebhookConfig::default();
        config
            .allowed_ips
            .insert(ProviderName::AyaPay, parse_allowlist("10.0.0.0/8").unwrap());
        let processor = processor(clock.clone(), config);

        let outside: IpAddr = "192.0.2.10".parse().unwrap();
        let err = processor
            .verify("ayapay", Some(outside), &HeaderMap::new(), &body("e1", clock.now()))
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature { .. }));
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn failed_apply_releases_the_event_id() {
        let clock = ManualClock::default();
        let processor = processor(clock.clone(), WebhookConfig::default());
        let payload = body("e9", clock.now());

        let event = match processor.verify("ayapay", None, &signed(), &payload).unwrap() {
            Verified::Fresh(event) => event,
            other => panic!("unexpected {:?}", other),
        };
        // No matching transaction, so the apply fails and the id is released.
        processor.dispatch(event).await.unwrap();
        assert!(matches!(
            processor.verify("ayapay", None, &signed(), &payload),
            Ok(Verified::Fresh(_))
        ));
    }
}
