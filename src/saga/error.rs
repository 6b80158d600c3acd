//! Error types for the transfer saga.

use std::time::Duration;

use thiserror::Error;

use crate::Amount;
use crate::ledger::{LedgerError, LedgerOperation};

/// Synchronous rejection of an update. Never changes saga state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("transfer already attempted")]
    AlreadyAttempted,

    #[error("from account is not set")]
    FromAccountNotSet,

    #[error("to account is not set")]
    ToAccountNotSet,

    #[error("invalid transfer amount ({0})")]
    InvalidAmount(f64),

    #[error("transfer amount (${amount}) exceeds daily limit (${limit})")]
    ExceedsDailyLimit { amount: Amount, limit: Amount },

    #[error("crypto account is not supported ({0})")]
    UnsupportedAccount(String),

    #[error("account cannot change after a transfer was attempted ({0})")]
    AccountLocked(String),
}

/// Error observed by the caller of an update.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The update failed validation and was not accepted.
    #[error(transparent)]
    Rejected(#[from] ValidationError),

    /// The update was accepted but its execution failed.
    #[error(transparent)]
    Failed(#[from] LedgerError),

    #[error("saga {0} not found")]
    NotFound(String),

    #[error("saga is closed")]
    Closed,
}

/// Failure of a single compensating ledger call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} on {account} failed: {source}")]
pub struct CompensationError {
    pub operation: LedgerOperation,
    pub account: String,
    #[source]
    pub source: LedgerError,
}

/// Terminal failure of a saga instance.
#[derive(Debug, Error)]
pub enum SagaError {
    /// One or more compensations failed. All of them were attempted.
    #[error("{}", join_errors(.0))]
    Compensation(Vec<CompensationError>),

    /// The forward path failed and was fully compensated. Only reported when
    /// the saga is configured to surface forward failures.
    #[error("transfer failed: {0}")]
    Forward(LedgerError),

    #[error("saga run timed out after {0:?}")]
    RunTimedOut(Duration),

    #[error("saga mailbox closed before a transfer was attempted")]
    Abandoned,

    #[error("saga task crashed: {0}")]
    Crashed(String),
}

fn join_errors(errors: &[CompensationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
