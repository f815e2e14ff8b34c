//! Reconciliation worker.
//!
//! Wakes on a fixed interval, polls the provider for every non-terminal
//! transaction that has gone quiet, and feeds terminal answers back through
//! the same settlement path webhooks use. Transactions that stay pending past
//! the hard timeout are cancelled best-effort and failed for manual review.

use crate::config::ReconciliationConfig;
use crate::database::transaction::Transaction;
use crate::payments::types::{ProviderName, ProviderStatus};
use crate::services::payment_orchestrator::{reasons, PaymentOrchestrator};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::database::error::DatabaseError),
}

/// What happened to one transaction during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The provider reported a terminal outcome and it was applied.
    Settled,
    /// Still pending at the provider, inside the timeout.
    StillPending,
    /// Failed with `RECONCILIATION_TIMEOUT` and flagged for review.
    TimedOut,
    /// Nothing to poll yet, or a poll or write failed.
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub examined: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub timed_out: usize,
    pub skipped: usize,
    /// The cycle did not run because the previous one was still going.
    pub overlapped: bool,
}

pub struct ReconciliationWorker {
    orchestrator: PaymentOrchestrator,
    config: ReconciliationConfig,
    running: Arc<AtomicBool>,
    limits: HashMap<ProviderName, Arc<Semaphore>>,
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReconciliationWorker {
    pub fn new(orchestrator: PaymentOrchestrator, config: ReconciliationConfig) -> Self {
        let limits = ProviderName::ALL
            .iter()
            .map(|name| {
                (
                    *name,
                    Arc::new(Semaphore::new(config.per_provider_concurrency.max(1))),
                )
            })
            .collect();
        Self {
            orchestrator,
            config,
            running: Arc::new(AtomicBool::new(false)),
            limits,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            timeout_secs = self.config.timeout_secs,
            batch_size = self.config.batch_size,
            "reconciliation worker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation worker stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.examined > 0 => info!(
                            examined = report.examined,
                            settled = report.settled,
                            still_pending = report.still_pending,
                            timed_out = report.timed_out,
                            skipped = report.skipped,
                            "reconciliation cycle finished"
                        ),
                        Ok(_) => debug!("reconciliation cycle found nothing stale"),
                        Err(e) => warn!(error = %e, "reconciliation cycle failed"),
                    }
                }
            }
        }

        info!("reconciliation worker stopped");
    }

    /// One pass over the stale set. A pass that starts while the previous
    /// one is still running returns immediately with `overlapped` set.
    pub async fn run_cycle(&self) -> Result<CycleReport, ReconciliationError> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("previous reconciliation cycle still running, skipping");
            return Ok(CycleReport {
                overlapped: true,
                ..CycleReport::default()
            });
        }
        let _guard = RunningGuard(self.running.clone());

        let now = self.orchestrator.clock().now();
        let stale = self
            .orchestrator
            .ledger()
            .find_stale(now - self.config.stale_after(), self.config.batch_size)
            .await?;

        let mut report = CycleReport {
            examined: stale.len(),
            ..CycleReport::default()
        };
        let outcomes = join_all(stale.into_iter().map(|tx| self.reconcile(tx))).await;
        for outcome in outcomes {
            match outcome {
                Reconciled::Settled => report.settled += 1,
                Reconciled::StillPending => report.still_pending += 1,
                Reconciled::TimedOut => report.timed_out += 1,
                Reconciled::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn reconcile(&self, tx: Transaction) -> Reconciled {
        if tx.is_terminal() {
            return Reconciled::Skipped;
        }

        let now = self.orchestrator.clock().now();
        let expired = now - tx.created_at > self.config.timeout();

        // Never reached the provider: nothing to ask about.
        let Some(provider_order_id) = tx.provider_order_id.clone() else {
            return if expired {
                self.time_out(&tx).await
            } else {
                self.note_poll(&tx, Err("NOT_DISPATCHED".to_string())).await;
                Reconciled::Skipped
            };
        };

        let Some(adapter) = self.orchestrator.registry().get(tx.provider) else {
            warn!(transaction_id = %tx.id, provider = %tx.provider, "no adapter for stale transaction");
            return Reconciled::Skipped;
        };

        let status = {
            let _permit = match self.limits.get(&tx.provider) {
                Some(limit) => limit.clone().acquire_owned().await.ok(),
                None => None,
            };
            adapter.query_status(&provider_order_id).await
        };

        match status {
            Ok(status) if status.status != ProviderStatus::Pending => {
                match self
                    .orchestrator
                    .apply_provider_status(tx.id, &status)
                    .await
                {
                    Ok((saved, outcome)) => {
                        info!(
                            transaction_id = %saved.id,
                            provider = %saved.provider,
                            state = %saved.state,
                            outcome = ?outcome,
                            "reconciliation applied provider status"
                        );
                        Reconciled::Settled
                    }
                    Err(e) => {
                        warn!(transaction_id = %tx.id, error = %e, "failed to apply polled status");
                        Reconciled::Skipped
                    }
                }
            }
            Ok(_) if expired => self.time_out(&tx).await,
            Ok(status) => {
                self.note_poll(&tx, Ok(serde_json::to_value(&status).unwrap_or_default()))
                    .await;
                Reconciled::StillPending
            }
            Err(e) if expired => {
                debug!(transaction_id = %tx.id, error = %e, "status query failed past timeout");
                self.time_out(&tx).await
            }
            Err(e) => {
                warn!(
                    transaction_id = %tx.id,
                    provider = %tx.provider,
                    error = %e,
                    "provider status query failed"
                );
                self.note_poll(&tx, Err(e.to_string())).await;
                Reconciled::Skipped
            }
        }
    }

    /// Rotates the record to the back of the stale order.
    async fn note_poll(&self, tx: &Transaction, result: Result<serde_json::Value, String>) {
        if let Err(e) = self.orchestrator.record_poll(tx.id, result).await {
            warn!(transaction_id = %tx.id, error = %e, "failed to record reconciliation poll");
        }
    }

    async fn time_out(&self, tx: &Transaction) -> Reconciled {
        self.orchestrator.cancel_at_provider(tx).await;
        match self
            .orchestrator
            .fail_for_review(tx.id, reasons::RECONCILIATION_TIMEOUT)
            .await
        {
            Ok(_) => Reconciled::TimedOut,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "failed to time out transaction");
                Reconciled::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::idempotency::InMemoryIdempotencyStore;
    use crate::clock::ManualClock;
    use crate::database::transaction::TransactionState;
    use crate::database::transaction_repository::InMemoryLedger;
    use crate::payments::error::{PaymentError, PaymentResult};
    use crate::payments::provider::{PaymentProvider, Provider};
    use crate::payments::registry::ProviderRegistry;
    use crate::payments::types::{
        DepositRequest, DepositResponse, PayAction, RecipientInfo, StatusResponse,
        WebhookEvent, WithdrawalRequest, WithdrawalResponse,
    };
    use crate::services::payment_orchestrator::{CreateDepositRequest, OrchestratorConfig};
    use async_trait::async_trait;
    use http::HeaderMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct PolledProvider {
        status: Mutex<ProviderStatus>,
        queries: AtomicUsize,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl PaymentProvider for PolledProvider {
        async fn create_deposit(&self, request: DepositRequest) -> PaymentResult<DepositResponse> {
            Ok(DepositResponse {
                provider_order_id: format!("W-{}", request.order_ref),
                pay_action: PayAction::Redirect {
                    url: "https://pay.example/checkout".to_string(),
                },
                provider_data: None,
            })
        }

        async fn create_withdrawal(
            &self,
            _request: WithdrawalRequest,
        ) -> PaymentResult<WithdrawalResponse> {
            Err(PaymentError::validation("unused", None))
        }

        async fn query_status(&self, _id: &str) -> PaymentResult<StatusResponse> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let status = *self.status.lock().unwrap();
            Ok(StatusResponse {
                status,
                amount: Some(5000),
                completed_at: None,
                failure_reason: None,
            })
        }

        async fn cancel(&self, _id: &str) -> PaymentResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> ProviderName {
            ProviderName::WavePay
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["MMK"]
        }

        fn verify_webhook_signature(&self, _payload: &[u8], _headers: &HeaderMap) -> bool {
            false
        }

        fn parse_webhook_event(&self, _payload: &[u8]) -> PaymentResult<WebhookEvent> {
            Err(PaymentError::validation("unused", None))
        }
    }

    struct Fixture {
        clock: ManualClock,
        provider: Arc<PolledProvider>,
        orchestrator: PaymentOrchestrator,
        worker: ReconciliationWorker,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let provider = Arc::new(PolledProvider {
            status: Mutex::new(ProviderStatus::Pending),
            queries: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        });
        let registry = ProviderRegistry::new().with_provider(Provider::Custom(provider.clone()));
        let orchestrator = PaymentOrchestrator::new(
            registry,
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryIdempotencyStore::new(
                chrono::Duration::hours(24),
                Arc::new(clock.clone()),
            )),
            OrchestratorConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));
        let worker = ReconciliationWorker::new(orchestrator.clone(), ReconciliationConfig::default());
        Fixture {
            clock,
            provider,
            orchestrator,
            worker,
        }
    }

    async fn processing_deposit(orchestrator: &PaymentOrchestrator) -> Transaction {
        orchestrator
            .create_deposit(CreateDepositRequest {
                user_id: "u1".to_string(),
                provider: ProviderName::WavePay,
                amount: 5000,
                currency: "MMK".to_string(),
                recipient: RecipientInfo::default(),
                description: None,
                idempotency_key: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_transactions_are_left_alone() {
        let f = fixture();
        processing_deposit(&f.orchestrator).await;
        let report = f.worker.run_cycle().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(f.provider.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_success_is_applied() {
        let f = fixture();
        let tx = processing_deposit(&f.orchestrator).await;
        *f.provider.status.lock().unwrap() = ProviderStatus::Success;
        f.clock.advance(chrono::Duration::minutes(6));

        let report = f.worker.run_cycle().await.unwrap();
        assert_eq!(report.settled, 1);
        let saved = f.orchestrator.get_transaction(tx.id).await.unwrap();
        assert_eq!(saved.state, TransactionState::Completed);

        // Terminal records are never polled again.
        f.clock.advance(chrono::Duration::minutes(6));
        let report = f.worker.run_cycle().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(f.provider.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_past_timeout_fails_for_review() {
        let f = fixture();
        let tx = processing_deposit(&f.orchestrator).await;

        f.clock.advance(chrono::Duration::minutes(10));
        let report = f.worker.run_cycle().await.unwrap();
        assert_eq!(report.still_pending, 1);

        f.clock.advance(chrono::Duration::hours(25));
        let report = f.worker.run_cycle().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(f.provider.cancels.load(Ordering::SeqCst), 1);

        let saved = f.orchestrator.get_transaction(tx.id).await.unwrap();
        assert_eq!(saved.state, TransactionState::Failed);
        assert_eq!(
            saved.failure_reason.as_deref(),
            Some(reasons::RECONCILIATION_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn pending_polls_rotate_through_a_small_batch() {
        let f = fixture();
        let worker = ReconciliationWorker::new(
            f.orchestrator.clone(),
            ReconciliationConfig {
                batch_size: 1,
                ..ReconciliationConfig::default()
            },
        );
        let older = processing_deposit(&f.orchestrator).await;
        f.clock.advance(chrono::Duration::minutes(1));
        let newer = processing_deposit(&f.orchestrator).await;

        f.clock.advance(chrono::Duration::minutes(6));
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.still_pending, 1);

        f.clock.advance(chrono::Duration::minutes(1));
        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(f.provider.queries.load(Ordering::SeqCst), 2);

        let polls = |tx: &Transaction| {
            tx.attempts
                .iter()
                .filter(|a| a.action == "reconciliation_poll")
                .count()
        };
        let older = f.orchestrator.get_transaction(older.id).await.unwrap();
        let newer = f.orchestrator.get_transaction(newer.id).await.unwrap();
        assert_eq!(polls(&older), 1);
        assert_eq!(polls(&newer), 1);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let f = fixture();
        f.worker.running.store(true, Ordering::SeqCst);
        let report = f.worker.run_cycle().await.unwrap();
        assert!(report.overlapped);

        f.worker.running.store(false, Ordering::SeqCst);
        let report = f.worker.run_cycle().await.unwrap();
        assert!(!report.overlapped);
        assert!(!f.worker.running.load(Ordering::SeqCst));
    }
}
