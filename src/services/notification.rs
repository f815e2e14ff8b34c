//! Transaction status events for notification and messaging consumers.
//!
//! The orchestrator publishes onto a bounded channel; a single
//! [`EventHandler`] drains it and runs the registered async handler for each
//! event in its own task. Nothing here reports back: a slow or failing
//! consumer can only lose events, never hold up a payment.

use crate::database::transaction::{Transaction, TransactionKind, TransactionState};
use crate::payments::types::ProviderName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionEventType {
    #[serde(rename = "transaction.created")]
    Created,
    #[serde(rename = "transaction.completed")]
    Completed,
    #[serde(rename = "transaction.failed")]
    Failed,
    #[serde(rename = "transaction.refunded")]
    Refunded,
    /// Needs a human: forced to `failed` by reconciliation.
    #[serde(rename = "transaction.review_required")]
    ReviewRequired,
}

impl TransactionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionEventType::Created => "transaction.created",
            TransactionEventType::Completed => "transaction.completed",
            TransactionEventType::Failed => "transaction.failed",
            TransactionEventType::Refunded => "transaction.refunded",
            TransactionEventType::ReviewRequired => "transaction.review_required",
        }
    }

    /// Event matching a state a transaction just entered, if any.
    pub fn for_state(state: TransactionState) -> Option<Self> {
        match state {
            TransactionState::Completed => Some(TransactionEventType::Completed),
            TransactionState::Failed | TransactionState::Rejected => {
                Some(TransactionEventType::Failed)
            }
            TransactionState::Refunded => Some(TransactionEventType::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    #[serde(rename = "type")]
    pub event_type: TransactionEventType,
    pub transaction_id: Uuid,
    pub user_id: String,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub provider: ProviderName,
    pub amount: i64,
    pub currency: String,
    pub failure_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(event_type: TransactionEventType, tx: &Transaction) -> Self {
        Self {
            event_type,
            transaction_id: tx.id,
            user_id: tx.user_id.clone(),
            kind: tx.kind,
            state: tx.state,
            provider: tx.provider,
            amount: tx.amount,
            currency: tx.currency.clone(),
            failure_reason: tx.failure_reason.clone(),
            occurred_at: tx.updated_at,
        }
    }
}

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventHandler<E: Send + Sync + 'static> {
    listener: mpsc::Receiver<E>,
    sender: mpsc::Sender<E>,
    handler: Handler<E>,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(buffer_size: usize, handler: Handler<E>) -> Self {
        let (sender, listener) = mpsc::channel(buffer_size);
        Self {
            listener,
            sender,
            handler,
        }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer::new(self.sender.clone())
    }

    /// Runs until every producer is dropped, then waits for in-flight
    /// handler tasks.
    pub async fn start_handler(mut self) {
        debug!("starting event handler");
        drop(self.sender);
        let jobs = Arc::new(AtomicI64::new(0));
        while let Some(event) = self.listener.recv().await {
            let handler = Arc::clone(&self.handler);
            jobs.fetch_add(1, Ordering::SeqCst);
            let job = jobs.clone();
            tokio::spawn(async move {
                (handler)(event).await;
                job.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while jobs.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        debug!("event handler has shut down");
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    pub fn new(sender: mpsc::Sender<E>) -> Self {
        Self { sender }
    }

    /// Fire-and-forget. A full or closed channel drops the event.
    pub fn publish_event(&self, event: E) {
        if let Err(e) = self.sender.try_send(event) {
            warn!(error = %e, "dropping transaction event");
        }
    }
}

pub type TransactionEventProducer = EventProducer<TransactionEvent>;

/// Default consumer: structured log line per event.
pub fn logging_handler() -> Handler<TransactionEvent> {
    Arc::new(|event: TransactionEvent| {
        Box::pin(async move {
            info!(
                event = event.event_type.as_str(),
                transaction_id = %event.transaction_id,
                user_id = %event.user_id,
                provider = %event.provider,
                state = %event.state,
                amount = event.amount,
                currency = %event.currency,
                failure_reason = ?event.failure_reason,
                "transaction event"
            );
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn handler_sees_every_event_from_every_producer() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let handler: Handler<u64> = Arc::new(move |v| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(v, Ordering::SeqCst);
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let event_handler = EventHandler::new(16, handler);
        let first = event_handler.subscribe();
        let second = event_handler.subscribe();
        for v in [1, 3, 5] {
            first.publish_event(v);
        }
        for v in [2, 4] {
            second.publish_event(v);
        }
        drop(first);
        drop(second);

        event_handler.start_handler().await;
        assert_eq!(seen.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn event_names_are_dotted() {
        let json = serde_json::to_value(TransactionEventType::ReviewRequired).unwrap();
        assert_eq!(json, serde_json::json!("transaction.review_required"));
        assert_eq!(
            TransactionEventType::for_state(TransactionState::Rejected),
            Some(TransactionEventType::Failed)
        );
        assert_eq!(TransactionEventType::for_state(TransactionState::Processing), None);
    }
}
