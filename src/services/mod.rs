//! Services module for business logic

pub mod balance;
pub mod notification;
pub mod payment_orchestrator;
pub mod webhook_processor;

pub use balance::{BalanceError, BalanceStore, InMemoryBalanceStore};
#[cfg(feature = "database")]
pub use balance::PostgresBalanceStore;
pub use notification::{TransactionEvent, TransactionEventProducer, TransactionEventType};
pub use payment_orchestrator::{
    CreateDepositRequest, CreateWithdrawalRequest, OrchestratorConfig, OrchestratorError,
    OrchestratorResult, PaymentOrchestrator, SettlementOutcome,
};
pub use webhook_processor::{Verified, WebhookError, WebhookProcessor};
