use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use crate::Amount;
use crate::ledger::{LedgerError, LedgerOperation};
use crate::model::TransferRequest;

/// Largest amount a single transfer may move.
pub const DAILY_AMOUNT_LIMIT: f64 = 100_000.0;

/// A reversal registered before a forward step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub operation: LedgerOperation,
    pub account: String,
    pub amount: f64,
}

impl Compensation {
    pub fn revert_withdraw(account: impl Into<String>, amount: f64) -> Self {
        Self {
            operation: LedgerOperation::RevertWithdraw,
            account: account.into(),
            amount,
        }
    }

    pub fn revert_deposit(account: impl Into<String>, amount: f64) -> Self {
        Self {
            operation: LedgerOperation::RevertDeposit,
            account: account.into(),
            amount,
        }
    }
}

/// Lifecycle phase of a saga, derived from its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaPhase {
    /// Accepting account updates, no transfer attempted yet.
    Open,
    /// Transfer accepted, forward steps running.
    Executing,
    /// A forward step failed, reversals running.
    Compensating,
    /// Transfer went through.
    Completed,
    /// Transfer failed and its reversals were attempted.
    Failed,
}

impl SagaPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaPhase::Completed | SagaPhase::Failed)
    }
}

/// Journal entry of a decision taken by a saga.
///
/// The same updates and activity results always yield the same journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SagaEvent {
    UpdateAccepted {
        update: String,
    },
    UpdateRejected {
        update: String,
        reason: String,
    },
    StepCompleted {
        operation: LedgerOperation,
        account: String,
    },
    StepFailed {
        operation: LedgerOperation,
        account: String,
        error: String,
    },
    CompensationCompleted {
        operation: LedgerOperation,
        account: String,
    },
    CompensationFailed {
        operation: LedgerOperation,
        account: String,
        error: String,
    },
}

/// State of one transfer saga.
///
/// Owned by the saga task; every mutation goes through one update or step
/// completion at a time.
#[derive(Debug, Default, Clone)]
pub struct TransferSagaState {
    from_account: String,
    to_account: String,
    transfer_attempted: bool,
    transfer_done: bool,
    compensated: bool,
    pending_compensations: Vec<Compensation>,
    terminal_error: Option<LedgerError>,
    history: Vec<SagaEvent>,
}

/// Reject account ids of an unsupported class.
pub fn validate_account(account: &str) -> Result<(), ValidationError> {
    if account.to_lowercase().contains("crypto") {
        return Err(ValidationError::UnsupportedAccount(account.to_string()));
    }
    Ok(())
}

impl TransferSagaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_account(&self) -> &str {
        &self.from_account
    }

    pub fn to_account(&self) -> &str {
        &self.to_account
    }

    pub fn transfer_attempted(&self) -> bool {
        self.transfer_attempted
    }

    pub fn transfer_done(&self) -> bool {
        self.transfer_done
    }

    pub fn pending_compensations(&self) -> &[Compensation] {
        &self.pending_compensations
    }

    pub fn terminal_error(&self) -> Option<&LedgerError> {
        self.terminal_error.as_ref()
    }

    pub fn history(&self) -> &[SagaEvent] {
        &self.history
    }

    pub fn phase(&self) -> SagaPhase {
        match (self.transfer_attempted, self.transfer_done) {
            (false, _) => SagaPhase::Open,
            (true, false) => SagaPhase::Executing,
            (true, true) if self.terminal_error.is_none() => SagaPhase::Completed,
            (true, true) if self.compensated => SagaPhase::Failed,
            (true, true) => SagaPhase::Compensating,
        }
    }

    /// Validate and set the source account.
    pub fn set_from_account(&mut self, account: String) -> Result<(), ValidationError> {
        self.check_account_change(&account)?;
        self.from_account = account;
        Ok(())
    }

    /// Validate and set the destination account.
    pub fn set_to_account(&mut self, account: String) -> Result<(), ValidationError> {
        self.check_account_change(&account)?;
        self.to_account = account;
        Ok(())
    }

    fn check_account_change(&self, account: &str) -> Result<(), ValidationError> {
        validate_account(account)?;
        if self.transfer_attempted {
            return Err(ValidationError::AccountLocked(account.to_string()));
        }
        Ok(())
    }

    /// Build a request from the accounts set so far.
    pub fn request_for(&self, amount: f64) -> TransferRequest {
        TransferRequest::new(&self.from_account, &self.to_account, amount)
    }

    /// Check `request` against the transfer rules without touching state.
    pub fn validate_transfer(
        &self,
        request: &TransferRequest,
        daily_limit: f64,
    ) -> Result<(), ValidationError> {
        if self.transfer_attempted {
            return Err(ValidationError::AlreadyAttempted);
        }
        if request.from_account.is_empty() {
            return Err(ValidationError::FromAccountNotSet);
        }
        if request.to_account.is_empty() {
            return Err(ValidationError::ToAccountNotSet);
        }
        if request.amount.is_nan() || request.amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(request.amount));
        }
        if request.amount > daily_limit {
            return Err(ValidationError::ExceedsDailyLimit {
                amount: Amount::from_float(request.amount),
                limit: Amount::from_float(daily_limit),
            });
        }
        Ok(())
    }

    /// Validate `request` and, when valid, mark the transfer as attempted.
    ///
    /// Validation and acceptance happen in one call so no second transfer can
    /// ever pass validation once this returns `Ok`.
    pub fn accept_transfer(
        &mut self,
        request: &TransferRequest,
        daily_limit: f64,
    ) -> Result<(), ValidationError> {
        self.validate_transfer(request, daily_limit)?;
        self.transfer_attempted = true;
        self.from_account.clone_from(&request.from_account);
        self.to_account.clone_from(&request.to_account);
        Ok(())
    }

    pub(crate) fn push_compensation(&mut self, compensation: Compensation) {
        debug_assert!(self.transfer_attempted && !self.transfer_done);
        self.pending_compensations.push(compensation);
    }

    /// Mark the forward path as finished, with its error if any.
    pub(crate) fn finish_forward(&mut self, error: Option<LedgerError>) {
        self.terminal_error = error;
        self.transfer_done = true;
    }

    /// Take the pending compensations, most recent first.
    pub(crate) fn begin_compensation(&mut self) -> Vec<Compensation> {
        let mut compensations = std::mem::take(&mut self.pending_compensations);
        compensations.reverse();
        compensations
    }

    /// Every taken compensation was attempted.
    pub(crate) fn end_compensation(&mut self) {
        self.compensated = true;
    }

    pub(crate) fn record(&mut self, event: SagaEvent) {
        self.history.push(event);
    }
}
