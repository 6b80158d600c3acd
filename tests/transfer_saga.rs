//! Integration tests for the transfer saga, driven through the client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use transfer_saga::ledger::LedgerOperation;
use transfer_saga::saga::{SagaEvent, ValidationError};
use transfer_saga::{
    Ledger, LedgerError, ReferenceLedger, SagaClient, SagaError, SagaOptions, SagaPhase,
    StartOptions, TransferRequest, Update, UpdateError, UpdateResponse,
};

/// Ledger that logs every call and refuses deposits to the listed accounts.
#[derive(Default)]
struct RecordingLedger {
    log: Mutex<Vec<String>>,
    refuse_deposits: Vec<String>,
    failing_reversals: bool,
    delay: Duration,
}

impl RecordingLedger {
    fn refusing_deposits_to(account: &str) -> Self {
        Self {
            refuse_deposits: vec![account.to_string()],
            ..Self::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn record(&self, operation: LedgerOperation, account: &str) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().unwrap().push(format!("{operation} {account}"));
    }

    fn reversal_result(&self, operation: LedgerOperation) -> Result<(), LedgerError> {
        if self.failing_reversals {
            return Err(LedgerError::Unavailable {
                operation,
                reason: "ledger offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn withdraw(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        self.record(LedgerOperation::Withdraw, account).await;
        Ok(())
    }

    async fn deposit(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        self.record(LedgerOperation::Deposit, account).await;
        if self.refuse_deposits.iter().any(|a| a == account) {
            return Err(LedgerError::AccountFrozen {
                operation: LedgerOperation::Deposit,
                account: account.to_string(),
            });
        }
        Ok(())
    }

    async fn revert_withdraw(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        self.record(LedgerOperation::RevertWithdraw, account).await;
        self.reversal_result(LedgerOperation::RevertWithdraw)
    }

    async fn revert_deposit(&self, account: &str, _amount: f64) -> Result<(), LedgerError> {
        self.record(LedgerOperation::RevertDeposit, account).await;
        self.reversal_result(LedgerOperation::RevertDeposit)
    }
}

fn transfer(from: &str, to: &str, amount: f64) -> Update {
    Update::Transfer(TransferRequest::new(from, to, amount))
}

fn no_retry() -> SagaOptions {
    let mut options = SagaOptions::default();
    options.activity.retry.max_attempts = 1;
    options
}

#[tokio::test]
async fn success_path_terminates_without_error() {
    let client = SagaClient::new(Arc::new(ReferenceLedger), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("ok")).await.unwrap();

    handle.update_and_wait(transfer("A", "B", 10.0)).await.unwrap();

    let report = handle.result().await.unwrap();
    assert_eq!(report.phase, SagaPhase::Completed);
    assert_eq!(report.transfer_error, None);
}

#[tokio::test]
async fn frozen_deposit_fails_update_but_not_instance() {
    let client = SagaClient::new(Arc::new(ReferenceLedger), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("frozen")).await.unwrap();

    let err = handle
        .update_and_wait(transfer("A", "B-piggy-bank", 10.0))
        .await
        .unwrap_err();
    match err {
        UpdateError::Failed(e) => {
            assert!(!e.is_retryable());
            assert_eq!(e.error_type(), "account-frozen");
        }
        other => panic!("expected ledger failure, got {other:?}"),
    }

    let report = handle.result().await.unwrap();
    assert_eq!(report.phase, SagaPhase::Failed);
    assert!(matches!(
        report.transfer_error,
        Some(LedgerError::AccountFrozen { .. })
    ));
}

#[tokio::test]
async fn compensations_run_newest_first() {
    let ledger = Arc::new(RecordingLedger::refusing_deposits_to("B"));
    let client = SagaClient::new(ledger.clone(), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("order")).await.unwrap();

    let _ = handle.update_and_wait(transfer("A", "B", 10.0)).await;
    handle.result().await.unwrap();

    assert_eq!(
        ledger.log(),
        vec!["withdraw A", "deposit B", "revert deposit B", "revert withdraw A"]
    );
}

#[tokio::test]
async fn failed_compensations_are_all_attempted_and_reported() {
    let ledger = Arc::new(RecordingLedger {
        failing_reversals: true,
        ..RecordingLedger::refusing_deposits_to("B")
    });
    let client = SagaClient::new(ledger.clone(), no_retry());
    let handle = client.start_transfer(StartOptions::new("broken")).await.unwrap();

    let _ = handle.update_and_wait(transfer("A", "B", 10.0)).await;

    let err = handle.result().await.unwrap_err();
    let SagaError::Compensation(errors) = &err else {
        panic!("expected compensation failure, got {err:?}");
    };
    assert_eq!(errors.len(), 2);
    assert_eq!(err.to_string().lines().count(), 2);
    assert_eq!(ledger.log().len(), 4);
}

#[tokio::test]
async fn invalid_amounts_leave_instance_untouched() {
    let client = SagaClient::new(Arc::new(ReferenceLedger), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("amounts")).await.unwrap();

    for amount in [0.0, -10.0, f64::NAN] {
        let err = handle.update(transfer("A", "B", amount)).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Rejected(ValidationError::InvalidAmount(_))
        ));
    }
    let err = handle
        .update(transfer("A", "B", 1_000_000.0))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "transfer amount ($1,000,000.00) exceeds daily limit ($100,000.00)"
    );

    // nothing was attempted, so a valid transfer is still accepted
    handle.update_and_wait(transfer("A", "B", 10.0)).await.unwrap();
    let report = handle.result().await.unwrap();
    assert_eq!(report.phase, SagaPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn only_the_first_of_two_transfers_executes() {
    let ledger = Arc::new(RecordingLedger {
        delay: Duration::from_millis(500),
        ..RecordingLedger::default()
    });
    let client = SagaClient::new(ledger.clone(), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("twice")).await.unwrap();

    let first = handle.update(transfer("A", "B", 10.0)).await.unwrap();
    let err = handle.update(transfer("C", "D", 20.0)).await.unwrap_err();
    assert_eq!(err.to_string(), "transfer already attempted");

    first.outcome().await.unwrap();
    handle.result().await.unwrap();
    assert_eq!(ledger.log(), vec!["withdraw A", "deposit B"]);
}

#[tokio::test]
async fn page_flow_through_wire_updates() {
    let client = SagaClient::new(Arc::new(ReferenceLedger), SagaOptions::default());
    let handle = client.start_transfer(StartOptions::new("page")).await.unwrap();

    let calls = [
        ("set-from-account", json!("crypto-savings")),
        ("set-from-account", json!("from-account-id")),
        ("set-to-account", json!("to-account-id")),
        ("transfer-amount", json!(42.5)),
    ];
    let mut responses = Vec::new();
    for (name, payload) in calls {
        let update = Update::from_name(name, payload).unwrap();
        let result = client.update_and_wait("page", update).await;
        responses.push(UpdateResponse::from_result(&result));
    }

    assert_eq!(
        responses[0].error,
        "crypto account is not supported (crypto-savings)"
    );
    assert!(responses[1..].iter().all(|r| r == &UpdateResponse::success()));

    let report = handle.result().await.unwrap();
    assert_eq!(report.phase, SagaPhase::Completed);
    assert!(report.history.contains(&SagaEvent::StepCompleted {
        operation: LedgerOperation::Deposit,
        account: "to-account-id".to_string(),
    }));
}

#[tokio::test]
async fn forward_failure_can_fail_the_instance() {
    let options = SagaOptions {
        fail_on_forward_error: true,
        ..SagaOptions::default()
    };
    let client = SagaClient::new(Arc::new(ReferenceLedger), options);
    let handle = client.start_transfer(StartOptions::new("strict")).await.unwrap();

    let _ = handle
        .update_and_wait(transfer("A-piggy", "B", 10.0))
        .await;

    assert!(matches!(
        handle.result().await,
        Err(SagaError::Forward(LedgerError::AccountFrozen { .. }))
    ));
}
