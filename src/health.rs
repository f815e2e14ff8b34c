//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::cache::idempotency::IdempotencyStore;
use crate::database::transaction_repository::TransactionLedger;
use crate::payments::registry::{ProviderHealth, ProviderRegistry};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    ledger: Arc<dyn TransactionLedger>,
    idempotency: Arc<dyn IdempotencyStore>,
    registry: ProviderRegistry,
}

impl HealthChecker {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        idempotency: Arc<dyn IdempotencyStore>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            ledger,
            idempotency,
            registry,
        }
    }

    /// Storage outages make the service unhealthy; an ailing or disabled
    /// provider only degrades it.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut storage_up = true;

        let start = Instant::now();
        let ledger = match timeout(CHECK_TIMEOUT, self.ledger.health_check()).await {
            Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
            Ok(Err(e)) => {
                error!(error = %e, "ledger health check failed");
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("ledger health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        storage_up &= ledger.status == ComponentState::Up;
        health_status.checks.insert("ledger".to_string(), ledger);

        let start = Instant::now();
        let idempotency = match timeout(CHECK_TIMEOUT, self.idempotency.health_check()).await {
            Ok(Ok(())) => ComponentHealth::up(Some(start.elapsed().as_millis())),
            Ok(Err(e)) => {
                error!(error = %e, "idempotency store health check failed");
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("idempotency store health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        storage_up &= idempotency.status == ComponentState::Up;
        health_status
            .checks
            .insert("idempotency_store".to_string(), idempotency);

        let mut providers_up = true;
        for summary in self.registry.summaries().await {
            let component = match (summary.enabled, summary.health) {
                (false, _) => ComponentHealth::warning(None, Some("disabled".to_string())),
                (true, ProviderHealth::Healthy) => ComponentHealth::up(None),
                (true, ProviderHealth::Degraded) => ComponentHealth::warning(
                    None,
                    Some(format!(
                        "{} of {} recent calls failed",
                        summary.failure_count,
                        summary.success_count + summary.failure_count
                    )),
                ),
                (true, ProviderHealth::Unhealthy) => {
                    warn!(provider = %summary.name, "provider marked unhealthy");
                    ComponentHealth::down(Some("failure rate above threshold".to_string()))
                }
            };
            providers_up &= component.status == ComponentState::Up;
            health_status
                .checks
                .insert(format!("provider:{}", summary.name), component);
        }

        health_status.status = match (storage_up, providers_up) {
            (false, _) => HealthState::Unhealthy,
            (true, false) => HealthState::Degraded,
            (true, true) => HealthState::Healthy,
        };

        health_status
    }
}
