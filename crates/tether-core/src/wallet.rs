//! wallet - balance collaborator and the in-memory ledger
//!
//! The state machine touches the wallet at exactly two points: the bet debit
//! on entering `Active`, and the credit on entering `Ended`. Persistence is
//! notified after the fact and can never undo a mutation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::types::SessionId;

/// starting balance for a fresh ledger
pub const WELCOME_BONUS: u64 = 100;

/// why the balance moved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// stake deducted when a session goes active
    Bet(SessionId),
    /// share of the pot at session end
    Winnings(SessionId),
    Refund(SessionId),
}

/// balance collaborator
pub trait Wallet: Send + Sync {
    fn has_sufficient_balance(&self, amount: u64) -> bool;

    /// Deduct `amount`. Returns `false` without changing anything when the
    /// balance is too low.
    fn debit(&self, amount: u64, reason: Reason) -> bool;

    fn credit(&self, amount: u64, reason: Reason);

    fn balance(&self) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    SessionWin,
    SessionLoss,
    Refund,
    Bonus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    /// positive for gains, negative for stakes
    pub amount: i64,
    pub description: String,
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    fn new(kind: TransactionKind, amount: i64, description: &str, session_id: Option<SessionId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            amount,
            description: description.to_string(),
            session_id,
            created_at: Utc::now(),
        }
    }

    pub fn formatted_amount(&self) -> String {
        if self.amount > 0 {
            format!("+{}", self.amount)
        } else {
            self.amount.to_string()
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("persistence write failed: {0}")]
    Write(String),
}

/// receives balance and transaction changes after they happened
pub trait PersistenceSink: Send + Sync {
    fn persist(&self, balance: u64, transaction: &Transaction) -> Result<(), PersistError>;
}

#[derive(Debug)]
struct LedgerState {
    balance: u64,
    /// newest first
    transactions: Vec<Transaction>,
}

/// in-memory wallet with transaction history
pub struct Ledger {
    state: Mutex<LedgerState>,
    sink: Option<Arc<dyn PersistenceSink>>,
}

impl Ledger {
    /// fresh ledger seeded with the welcome bonus
    pub fn new() -> Self {
        let bonus = Transaction::new(TransactionKind::Bonus, WELCOME_BONUS as i64, "Welcome bonus!", None);
        Self {
            state: Mutex::new(LedgerState {
                balance: WELCOME_BONUS,
                transactions: vec![bonus],
            }),
            sink: None,
        }
    }

    pub fn with_balance(balance: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                balance,
                transactions: Vec::new(),
            }),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// add purchased coins
    pub fn add_coins(&self, amount: u64, description: &str) {
        let amount = amount as i64;
        self.apply(amount, Transaction::new(TransactionKind::Purchase, amount, description, None));
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }

    /// Apply a balance change. Fails only when a debit would go negative.
    fn apply(&self, delta: i64, transaction: Transaction) -> bool {
        let balance = {
            let mut state = self.state.lock();
            let next = state.balance as i64 + delta;
            if next < 0 {
                return false;
            }
            state.balance = next as u64;
            state.transactions.insert(0, transaction.clone());
            state.balance
        };

        // the in-memory mutation stands regardless of what the sink says
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(balance, &transaction) {
                tracing::warn!("failed to persist wallet change: {}", e);
            }
        }
        true
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Wallet for Ledger {
    fn has_sufficient_balance(&self, amount: u64) -> bool {
        self.state.lock().balance >= amount
    }

    fn debit(&self, amount: u64, reason: Reason) -> bool {
        let (kind, description, session) = describe(reason);
        let amount = amount as i64;
        let applied = self.apply(-amount, Transaction::new(kind, -amount, description, Some(session)));
        if !applied {
            tracing::warn!("debit of {} refused: insufficient balance", amount);
        }
        applied
    }

    fn credit(&self, amount: u64, reason: Reason) {
        let (kind, description, session) = describe(reason);
        let amount = amount as i64;
        self.apply(amount, Transaction::new(kind, amount, description, Some(session)));
    }

    fn balance(&self) -> u64 {
        self.state.lock().balance
    }
}

fn describe(reason: Reason) -> (TransactionKind, &'static str, SessionId) {
    match reason {
        Reason::Bet(id) => (TransactionKind::SessionLoss, "Challenge bet", id),
        Reason::Winnings(id) => (TransactionKind::SessionWin, "Won challenge", id),
        Reason::Refund(id) => (TransactionKind::Refund, "Session refund", id),
    }
}
