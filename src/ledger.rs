//! Ledger activities.
//!
//! The saga only depends on the four-operation [`Ledger`] contract. The
//! [`ReferenceLedger`] is a stand-in policy for a real ledger integration.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The side-effecting operations a saga can run against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    Withdraw,
    Deposit,
    RevertWithdraw,
    RevertDeposit,
}

impl LedgerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOperation::Withdraw => "withdraw",
            LedgerOperation::Deposit => "deposit",
            LedgerOperation::RevertWithdraw => "revert withdraw",
            LedgerOperation::RevertDeposit => "revert deposit",
        }
    }
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a ledger operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Ledger policy refuses to move funds on this account. Never retried.
    #[error("{operation} failed: account {account} is frozen")]
    AccountFrozen {
        operation: LedgerOperation,
        account: String,
    },

    /// Transient ledger or infrastructure failure.
    #[error("{operation} failed: ledger unavailable: {reason}")]
    Unavailable {
        operation: LedgerOperation,
        reason: String,
    },

    /// The operation did not finish within its start-to-close timeout.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: LedgerOperation,
        timeout: Duration,
    },
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LedgerError::AccountFrozen { .. })
    }

    /// Stable error type tag, as reported to callers.
    pub fn error_type(&self) -> &'static str {
        match self {
            LedgerError::AccountFrozen { .. } => "account-frozen",
            LedgerError::Unavailable { .. } => "ledger-unavailable",
            LedgerError::Timeout { .. } => "timeout",
        }
    }
}

/// Account ledger contract used by the transfer saga.
///
/// Implementations should be idempotent for a given account and amount: the
/// activity runner may call an operation again after a retryable failure.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn withdraw(&self, account: &str, amount: f64) -> Result<(), LedgerError>;

    async fn deposit(&self, account: &str, amount: f64) -> Result<(), LedgerError>;

    async fn revert_withdraw(&self, account: &str, amount: f64) -> Result<(), LedgerError>;

    async fn revert_deposit(&self, account: &str, amount: f64) -> Result<(), LedgerError>;
}

/// Dispatch `operation` to the matching ledger call.
pub async fn invoke(
    ledger: &dyn Ledger,
    operation: LedgerOperation,
    account: &str,
    amount: f64,
) -> Result<(), LedgerError> {
    match operation {
        LedgerOperation::Withdraw => ledger.withdraw(account, amount).await,
        LedgerOperation::Deposit => ledger.deposit(account, amount).await,
        LedgerOperation::RevertWithdraw => ledger.revert_withdraw(account, amount).await,
        LedgerOperation::RevertDeposit => ledger.revert_deposit(account, amount).await,
    }
}

/// Reference ledger policy: every account whose id contains "piggy" is frozen.
///
/// Reversals always succeed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceLedger;

impl ReferenceLedger {
    pub fn is_frozen(account: &str) -> bool {
        account.to_lowercase().contains("piggy")
    }

    fn check(operation: LedgerOperation, account: &str) -> Result<(), LedgerError> {
        if Self::is_frozen(account) {
            return Err(LedgerError::AccountFrozen {
                operation,
                account: account.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for ReferenceLedger {
    async fn withdraw(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        Self::check(LedgerOperation::Withdraw, account)
    }

    async fn deposit(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        Self::check(LedgerOperation::Deposit, account)
    }

    async fn revert_withdraw(&self, _account: &str, _amount: f64) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn revert_deposit(&self, _account: &str, _amount: f64) -> Result<(), LedgerError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockLedger;
    use super::*;

    #[tokio::test]
    async fn reference_ledger_moves_funds_for_regular_accounts() {
        let ledger = ReferenceLedger;
        assert!(ledger.withdraw("from-account-1", 10.0).await.is_ok());
        assert!(ledger.deposit("to-account-51", 10.0).await.is_ok());
    }

    #[tokio::test]
    async fn reference_ledger_rejects_piggy_accounts() {
        let ledger = ReferenceLedger;

        let err = ledger.deposit("my-to-account-PIGGY-bank", 10.0).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::AccountFrozen {
                operation: LedgerOperation::Deposit,
                account: "my-to-account-PIGGY-bank".to_string(),
            }
        );
        assert!(!err.is_retryable());
        assert_eq!(err.error_type(), "account-frozen");
        assert_eq!(
            err.to_string(),
            "deposit failed: account my-to-account-PIGGY-bank is frozen"
        );

        let err = ledger.withdraw("piggy", 10.0).await.unwrap_err();
        assert!(err.to_string().starts_with("withdraw failed"));
    }

    #[tokio::test]
    async fn reference_ledger_reversals_never_fail() {
        let ledger = ReferenceLedger;
        assert!(ledger.revert_withdraw("piggy-bank", 10.0).await.is_ok());
        assert!(ledger.revert_deposit("piggy-bank", 10.0).await.is_ok());
    }

    #[test]
    fn transient_errors_are_retryable() {
        let unavailable = mock::unavailable(LedgerOperation::Deposit);
        assert!(unavailable.is_retryable());

        let timeout = LedgerError::Timeout {
            operation: LedgerOperation::Withdraw,
            timeout: Duration::from_secs(10),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.error_type(), "timeout");
    }

    #[tokio::test]
    async fn invoke_dispatches_by_operation() {
        let ledger = MockLedger::new();
        for op in [
            LedgerOperation::Withdraw,
            LedgerOperation::Deposit,
            LedgerOperation::RevertDeposit,
            LedgerOperation::RevertWithdraw,
        ] {
            invoke(&ledger, op, "acc", 1.0).await.unwrap();
        }
        assert_eq!(
            ledger.operations(),
            vec![
                LedgerOperation::Withdraw,
                LedgerOperation::Deposit,
                LedgerOperation::RevertDeposit,
                LedgerOperation::RevertWithdraw,
            ]
        );
    }

    #[tokio::test]
    async fn mock_ledger_fails_queued_calls_once() {
        let ledger = MockLedger::new();
        ledger.fail_next(
            LedgerOperation::Deposit,
            mock::unavailable(LedgerOperation::Deposit),
        );

        assert!(ledger.deposit("acc", 1.0).await.is_err());
        assert!(ledger.deposit("acc", 1.0).await.is_ok());
        assert_eq!(ledger.calls().len(), 2);
    }
}
