use crate::payments::credentials::ProviderCredential;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::Provider;
use crate::payments::providers::{AyaPayProvider, KbzPayProvider, WavePayProvider};
use crate::payments::types::{ProviderEnvironment, ProviderName};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Below this many calls a provider is always reported healthy.
const MIN_HEALTH_SAMPLE: u64 = 10;
const DEGRADED_FAILURE_RATE: f64 = 0.15;
const UNHEALTHY_FAILURE_RATE: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub health: ProviderHealth,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            last_request_at: None,
            last_failure_at: None,
            health: ProviderHealth::Healthy,
        }
    }
}

impl ProviderMetrics {
    pub fn total_requests(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.total_requests() {
            0 => 1.0,
            total => self.success_count as f64 / total as f64,
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.last_request_at = Some(Utc::now());
        self.recompute_health();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        let now = Utc::now();
        self.last_request_at = Some(now);
        self.last_failure_at = Some(now);
        self.recompute_health();
    }

    fn recompute_health(&mut self) {
        if self.total_requests() < MIN_HEALTH_SAMPLE {
            self.health = ProviderHealth::Healthy;
            return;
        }
        let failure_rate = 1.0 - self.success_rate();
        self.health = if failure_rate >= UNHEALTHY_FAILURE_RATE {
            ProviderHealth::Unhealthy
        } else if failure_rate >= DEGRADED_FAILURE_RATE {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Healthy
        };
    }
}

#[derive(Debug, Clone)]
struct ProviderState {
    enabled: bool,
    environment: Option<ProviderEnvironment>,
    metrics: ProviderMetrics,
}

/// What `GET /payments/providers` reports for one adapter.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub name: ProviderName,
    pub enabled: bool,
    pub health: ProviderHealth,
    pub environment: Option<ProviderEnvironment>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Configured adapters keyed by provider name.
///
/// The adapter set is fixed once start-up finishes. Enable flags and health
/// counters change at runtime. A disabled provider refuses new payments but
/// still serves webhooks and status queries for transactions already in
/// flight.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Provider>,
    state: Arc<RwLock<HashMap<ProviderName, ProviderState>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Meant for start-up; a later registration under
    /// the same name replaces the earlier one.
    pub fn register(&mut self, provider: Provider, environment: Option<ProviderEnvironment>) {
        let name = provider.name();
        self.providers.insert(name, provider);
        let entry = ProviderState {
            enabled: true,
            environment,
            metrics: ProviderMetrics::default(),
        };
        match self.state.try_write() {
            Ok(mut state) => {
                state.insert(name, entry);
            }
            Err(_) => warn!(provider = %name, "provider state busy, registration ignored"),
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.register(provider, None);
        self
    }

    /// Build adapters for every provider named in `ENABLED_PAYMENT_PROVIDERS`
    /// (default: all three). Providers whose credentials are missing are
    /// skipped with a warning unless nothing else could be built.
    pub fn from_env() -> PaymentResult<Self> {
        let enabled = Self::enabled_from_env()?;
        let mut registry = Self::new();
        let mut last_error = None;

        for name in &enabled {
            match Self::build(*name) {
                Ok((provider, environment)) => {
                    info!(provider = %name, environment = ?environment, "payment provider configured");
                    registry.register(provider, Some(environment));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "payment provider skipped");
                    last_error = Some(e);
                }
            }
        }

        if registry.providers.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(registry)
    }

    fn enabled_from_env() -> PaymentResult<Vec<ProviderName>> {
        let raw = std::env::var("ENABLED_PAYMENT_PROVIDERS")
            .unwrap_or_else(|_| "kbzpay,wavepay,ayapay".to_string());
        let mut names = Vec::new();
        for part in raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            let name = ProviderName::from_str(value)?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn build(name: ProviderName) -> PaymentResult<(Provider, ProviderEnvironment)> {
        let credential = ProviderCredential::from_env(name)?;
        let environment = credential.environment;
        let provider = match name {
            ProviderName::KbzPay => Provider::KbzPay(Arc::new(KbzPayProvider::new(credential)?)),
            ProviderName::WavePay => {
                Provider::WavePay(Arc::new(WavePayProvider::new(credential)?))
            }
            ProviderName::AyaPay => Provider::AyaPay(Arc::new(AyaPayProvider::new(credential)?)),
        };
        Ok((provider, environment))
    }

    pub fn names(&self) -> Vec<ProviderName> {
        let mut names: Vec<ProviderName> = self.providers.keys().copied().collect();
        names.sort();
        names
    }

    /// Any configured adapter, enabled or not.
    pub fn get(&self, name: ProviderName) -> Option<Provider> {
        self.providers.get(&name).cloned()
    }

    /// An adapter that may accept new payments.
    pub async fn get_enabled(&self, name: ProviderName) -> PaymentResult<Provider> {
        let provider = self.get(name).ok_or_else(|| {
            PaymentError::validation(
                format!("provider {} is not configured", name),
                Some("provider"),
            )
        })?;
        let enabled = self
            .state
            .read()
            .await
            .get(&name)
            .map(|s| s.enabled)
            .unwrap_or(false);
        if !enabled {
            return Err(PaymentError::validation(
                format!("provider {} is disabled", name),
                Some("provider"),
            ));
        }
        Ok(provider)
    }

    /// Returns `false` when the provider is not configured.
    pub async fn set_enabled(&self, name: ProviderName, enabled: bool) -> bool {
        let mut state = self.state.write().await;
        match state.get_mut(&name) {
            Some(entry) => {
                if entry.enabled != enabled {
                    info!(provider = %name, enabled = enabled, "provider availability changed");
                }
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn record_success(&self, name: ProviderName) {
        if let Some(entry) = self.state.write().await.get_mut(&name) {
            entry.metrics.record_success();
        }
    }

    pub async fn record_failure(&self, name: ProviderName) {
        if let Some(entry) = self.state.write().await.get_mut(&name) {
            let before = entry.metrics.health;
            entry.metrics.record_failure();
            if entry.metrics.health != before {
                warn!(
                    provider = %name,
                    health = ?entry.metrics.health,
                    success_rate = entry.metrics.success_rate(),
                    "provider health changed"
                );
            }
        }
    }

    pub async fn health(&self, name: ProviderName) -> Option<ProviderHealth> {
        self.state
            .read()
            .await
            .get(&name)
            .map(|s| s.metrics.health)
    }

    pub async fn summaries(&self) -> Vec<ProviderSummary> {
        let state = self.state.read().await;
        self.names()
            .into_iter()
            .filter_map(|name| {
                state.get(&name).map(|s| ProviderSummary {
                    name,
                    enabled: s.enabled,
                    health: s.metrics.health,
                    environment: s.environment,
                    success_count: s.metrics.success_count,
                    failure_count: s.metrics.failure_count,
                    last_failure_at: s.metrics.last_failure_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::credentials::ProviderCredential;

    fn kbzpay() -> Provider {
        let credential = ProviderCredential {
            provider: ProviderName::KbzPay,
            merchant_id: "m".to_string(),
            app_id: "a".to_string(),
            secret_key: "s".to_string(),
            webhook_secret: None,
            base_url: "https://kbz.example.com".to_string(),
            environment: ProviderEnvironment::Sandbox,
            timeout_secs: 5,
            notify_url: None,
        };
        Provider::KbzPay(Arc::new(KbzPayProvider::new(credential).unwrap()))
    }

    #[test]
    fn health_degrades_with_failure_rate() {
        let mut metrics = ProviderMetrics::default();
        for _ in 0..8 {
            metrics.record_success();
        }
        metrics.record_failure();
        metrics.record_failure();
        // 2 of 10 failed
        assert_eq!(metrics.health, ProviderHealth::Degraded);

        for _ in 0..3 {
            metrics.record_failure();
        }
        assert_eq!(metrics.health, ProviderHealth::Unhealthy);

        for _ in 0..40 {
            metrics.record_success();
        }
        assert_eq!(metrics.health, ProviderHealth::Healthy);
    }

    #[test]
    fn small_samples_stay_healthy() {
        let mut metrics = ProviderMetrics::default();
        for _ in 0..5 {
            metrics.record_failure();
        }
        assert_eq!(metrics.health, ProviderHealth::Healthy);
    }

    #[tokio::test]
    async fn disabled_provider_rejects_new_payments_but_stays_resolvable() {
        let mut registry = ProviderRegistry::new();
        registry.register(kbzpay(), Some(ProviderEnvironment::Sandbox));

        assert!(registry.get_enabled(ProviderName::KbzPay).await.is_ok());
        assert!(registry.set_enabled(ProviderName::KbzPay, false).await);
        assert!(registry.get_enabled(ProviderName::KbzPay).await.is_err());
        assert!(registry.get(ProviderName::KbzPay).is_some());

        assert!(!registry.set_enabled(ProviderName::WavePay, false).await);
        assert!(registry.get_enabled(ProviderName::WavePay).await.is_err());
    }

    #[tokio::test]
    async fn summaries_report_every_registered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(kbzpay(), Some(ProviderEnvironment::Sandbox));
        registry.record_failure(ProviderName::KbzPay).await;

        let summaries = registry.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, ProviderName::KbzPay);
        assert_eq!(summaries[0].failure_count, 1);
        assert_eq!(summaries[0].environment, Some(ProviderEnvironment::Sandbox));
    }
}
