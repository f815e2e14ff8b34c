//! Transaction record and its state machine.

use crate::payments::types::{PayAction, ProviderName, RecipientInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Refund => "refund",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "refund" => Ok(TransactionKind::Refund),
            other => Err(format!("unknown transaction kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Approved,
    Processing,
    Completed,
    Failed,
    Rejected,
    Refunded,
}

impl TransactionState {
    pub const NON_TERMINAL: [TransactionState; 3] = [
        TransactionState::Pending,
        TransactionState::Approved,
        TransactionState::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "pending",
            TransactionState::Approved => "approved",
            TransactionState::Processing => "processing",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
            TransactionState::Rejected => "rejected",
            TransactionState::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed
                | TransactionState::Failed
                | TransactionState::Rejected
                | TransactionState::Refunded
        )
    }

    /// Edges of the state machine, narrowed by transaction kind: only
    /// withdrawals pass through `approved`, only deposits can be refunded.
    pub fn can_transition_to(&self, to: TransactionState, kind: TransactionKind) -> bool {
        use TransactionKind::*;
        use TransactionState::*;

        match (self, to) {
            (Pending, Processing) => matches!(kind, Deposit | Refund),
            (Pending, Approved) => kind == Withdrawal,
            (Approved, Processing) => kind == Withdrawal,
            (Pending, Failed) | (Pending, Rejected) => true,
            (Approved, Failed) | (Approved, Rejected) => kind == Withdrawal,
            (Processing, Completed) | (Processing, Failed) => true,
            (Completed, Refunded) => kind == Deposit,
            _ => false,
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionState::Pending),
            "approved" => Ok(TransactionState::Approved),
            "processing" => Ok(TransactionState::Processing),
            "completed" => Ok(TransactionState::Completed),
            "failed" => Ok(TransactionState::Failed),
            "rejected" => Ok(TransactionState::Rejected),
            "refunded" => Ok(TransactionState::Refunded),
            other => Err(format!("unknown transaction state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition {from} -> {to} for {kind} transaction")]
pub struct TransitionError {
    pub kind: TransactionKind,
    pub from: TransactionState,
    pub to: TransactionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: Option<TransactionState>,
    pub to: TransactionState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Audit action written right before the provider is first asked to create
/// the order.
pub const DISPATCH_ACTION: &str = "dispatch";

/// One provider round-trip or inbound notification, kept forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub request_summary: Option<JsonValue>,
    pub response_summary: Option<JsonValue>,
    pub error: Option<String>,
    /// Provider event id for webhook-driven entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl Attempt {
    pub fn new(action: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            action: action.into(),
            request_summary: None,
            response_summary: None,
            error: None,
            event_id: None,
        }
    }

    pub fn request(mut self, summary: JsonValue) -> Self {
        self.request_summary = Some(summary);
        self
    }

    pub fn response(mut self, summary: JsonValue) -> Self {
        self.response_summary = Some(summary);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub provider_order_id: Option<String>,
    pub kind: TransactionKind,
    pub state: TransactionState,
    /// Smallest currency unit.
    pub amount: i64,
    pub currency: String,
    pub provider: ProviderName,
    pub user_id: String,
    pub recipient: RecipientInfo,
    pub payment_method_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub parent_transaction_id: Option<Uuid>,
    pub pay_action: Option<PayAction>,
    pub failure_reason: Option<String>,
    pub attempts: Vec<Attempt>,
    pub history: Vec<StateChange>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct NewTransaction {
    pub kind: TransactionKind,
    pub provider: ProviderName,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub recipient: RecipientInfo,
    pub payment_method_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub parent_transaction_id: Option<Uuid>,
}

impl Transaction {
    pub fn new(new: NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_order_id: None,
            kind: new.kind,
            state: TransactionState::Pending,
            amount: new.amount,
            currency: new.currency.to_uppercase(),
            provider: new.provider,
            user_id: new.user_id,
            recipient: new.recipient,
            payment_method_id: new.payment_method_id,
            idempotency_key: new.idempotency_key,
            parent_transaction_id: new.parent_transaction_id,
            pay_action: None,
            failure_reason: None,
            attempts: Vec::new(),
            history: vec![StateChange {
                from: None,
                to: TransactionState::Pending,
                at: now,
                reason: None,
            }],
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(
        &mut self,
        to: TransactionState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to, self.kind) {
            return Err(TransitionError {
                kind: self.kind,
                from: self.state,
                to,
            });
        }
        self.history.push(StateChange {
            from: Some(self.state),
            to,
            at: now,
            reason: reason.clone(),
        });
        self.state = to;
        self.updated_at = now;
        match to {
            TransactionState::Completed => self.completed_at = Some(now),
            TransactionState::Failed | TransactionState::Rejected => {
                if reason.is_some() {
                    self.failure_reason = reason;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn record(&mut self, attempt: Attempt) {
        if attempt.timestamp > self.updated_at {
            self.updated_at = attempt.timestamp;
        }
        self.attempts.push(attempt);
    }

    pub fn has_event(&self, event_id: &str) -> bool {
        self.attempts
            .iter()
            .any(|a| a.event_id.as_deref() == Some(event_id))
    }

    /// True once the provider may hold an order for this record.
    pub fn dispatch_started(&self) -> bool {
        self.provider_order_id.is_some()
            || self.attempts.iter().any(|a| a.action == DISPATCH_ACTION)
    }
}

/// True when `history` is a walk through the state machine starting at
/// `pending`.
pub fn is_valid_history(kind: TransactionKind, history: &[StateChange]) -> bool {
    let mut iter = history.iter();
    let mut current = match iter.next() {
        Some(first) if first.from.is_none() && first.to == TransactionState::Pending => first.to,
        _ => return false,
    };
    for change in iter {
        if change.from != Some(current) || !current.can_transition_to(change.to, kind) {
            return false;
        }
        current = change.to;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(kind: TransactionKind) -> Transaction {
        Transaction::new(
            NewTransaction {
                kind,
                provider: ProviderName::KbzPay,
                user_id: "user-1".to_string(),
                amount: 100000,
                currency: "mmk".to_string(),
                recipient: RecipientInfo::default(),
                payment_method_id: None,
                idempotency_key: None,
                parent_transaction_id: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn deposit_path_is_recorded() {
        let mut t = tx(TransactionKind::Deposit);
        assert_eq!(t.currency, "MMK");
        t.transition(TransactionState::Processing, None, Utc::now())
            .unwrap();
        t.transition(TransactionState::Completed, None, Utc::now())
            .unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.is_terminal());
        assert_eq!(t.history.len(), 3);
        assert!(is_valid_history(t.kind, &t.history));
    }

    #[test]
    fn dispatch_marker_or_order_id_counts_as_started() {
        let mut t = tx(TransactionKind::Deposit);
        assert!(!t.dispatch_started());
        t.record(Attempt::new("cancel", Utc::now()).error("refused"));
        assert!(!t.dispatch_started());
        t.record(Attempt::new(DISPATCH_ACTION, Utc::now()));
        assert!(t.dispatch_started());

        let mut t = tx(TransactionKind::Deposit);
        t.provider_order_id = Some("KBZ-1".to_string());
        assert!(t.dispatch_started());
    }

    #[test]
    fn deposits_never_pass_through_approved() {
        let mut t = tx(TransactionKind::Deposit);
        let err = t
            .transition(TransactionState::Approved, None, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, TransactionState::Pending);
        assert_eq!(t.state, TransactionState::Pending);
    }

    #[test]
    fn withdrawals_must_be_approved_first() {
        let mut t = tx(TransactionKind::Withdrawal);
        assert!(t
            .transition(TransactionState::Processing, None, Utc::now())
            .is_err());
        t.transition(TransactionState::Approved, None, Utc::now())
            .unwrap();
        t.transition(TransactionState::Processing, None, Utc::now())
            .unwrap();
        assert!(is_valid_history(t.kind, &t.history));
    }

    #[test]
    fn terminal_states_do_not_revert() {
        for terminal in [
            TransactionState::Failed,
            TransactionState::Rejected,
            TransactionState::Refunded,
        ] {
            for target in [
                TransactionState::Pending,
                TransactionState::Approved,
                TransactionState::Processing,
                TransactionState::Completed,
            ] {
                assert!(!terminal.can_transition_to(target, TransactionKind::Deposit));
                assert!(!terminal.can_transition_to(target, TransactionKind::Withdrawal));
            }
        }
        assert!(TransactionState::Completed
            .can_transition_to(TransactionState::Refunded, TransactionKind::Deposit));
        assert!(!TransactionState::Completed
            .can_transition_to(TransactionState::Refunded, TransactionKind::Withdrawal));
        assert!(!TransactionState::Completed
            .can_transition_to(TransactionState::Failed, TransactionKind::Deposit));
    }

    #[test]
    fn failure_reason_is_kept() {
        let mut t = tx(TransactionKind::Withdrawal);
        t.transition(
            TransactionState::Rejected,
            Some("INSUFFICIENT_BALANCE".to_string()),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.failure_reason.as_deref(), Some("INSUFFICIENT_BALANCE"));
    }

    #[test]
    fn invalid_history_is_detected() {
        let now = Utc::now();
        let history = vec![
            StateChange {
                from: None,
                to: TransactionState::Pending,
                at: now,
                reason: None,
            },
            StateChange {
                from: Some(TransactionState::Pending),
                to: TransactionState::Completed,
                at: now,
                reason: None,
            },
        ];
        assert!(!is_valid_history(TransactionKind::Deposit, &history));
    }

    #[test]
    fn serializes_camel_case() {
        let t = tx(TransactionKind::Deposit);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["state"], "pending");
        assert!(json.get("providerOrderId").is_some());
        assert_eq!(json["amount"], 100000);
    }
}
