use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::{error, info};

use crate::model::ReadReceipt;

/// What happened to a receipt handed to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// The receipt was applied to a message and removed from the queue
    Applied {
        message_id: String,
        conversation_id: String,
    },
    /// No stored message matches yet; the receipt stays pending
    NoMatch,
    /// Another task claimed the receipt between lookup and apply
    AlreadyClaimed,
    /// A storage or directory call failed; the receipt stays pending
    CollaboratorFailure { error: String },
}

impl ReceiptOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Whether the receipt is still waiting in the queue afterwards.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NoMatch | Self::CollaboratorFailure { .. })
    }
}

impl fmt::Display for ReceiptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied {
                message_id,
                conversation_id,
            } => write!(f, "applied to {message_id} in {conversation_id}"),
            Self::NoMatch => f.write_str("no match"),
            Self::AlreadyClaimed => f.write_str("already claimed"),
            Self::CollaboratorFailure { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Observability hook notified of every reconciliation outcome.
pub trait ReceiptObserver: Send + Sync {
    fn on_outcome(&self, receipt: &ReadReceipt, outcome: &ReceiptOutcome);
}

/// Observer that only writes outcomes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ReceiptObserver for TracingObserver {
    fn on_outcome(&self, receipt: &ReadReceipt, outcome: &ReceiptOutcome) {
        match outcome {
            ReceiptOutcome::CollaboratorFailure { error } => error!(
                reader = receipt.reader(),
                timestamp = receipt.timestamp(),
                error = %error,
                "read receipt left pending after failure"
            ),
            other => info!(
                reader = receipt.reader(),
                timestamp = receipt.timestamp(),
                outcome = ?other,
                "read receipt processed"
            ),
        }
    }
}

/// Observer that keeps every outcome in memory, in arrival order.
#[derive(Debug, Default)]
pub struct OutcomeLog {
    entries: Mutex<Vec<(ReadReceipt, ReceiptOutcome)>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(ReadReceipt, ReceiptOutcome)> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ReceiptObserver for OutcomeLog {
    fn on_outcome(&self, receipt: &ReadReceipt, outcome: &ReceiptOutcome) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((receipt.clone(), outcome.clone()));
    }
}

/// Tally of one pass over the pending queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingSummary {
    pub applied: usize,
    pub no_match: usize,
    pub already_claimed: usize,
    pub failed: usize,
}

impl PendingSummary {
    pub fn record(&mut self, outcome: &ReceiptOutcome) {
        match outcome {
            ReceiptOutcome::Applied { .. } => self.applied += 1,
            ReceiptOutcome::NoMatch => self.no_match += 1,
            ReceiptOutcome::AlreadyClaimed => self.already_claimed += 1,
            ReceiptOutcome::CollaboratorFailure { .. } => self.failed += 1,
        }
    }
}
