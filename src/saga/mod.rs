//! Transfer saga.
//!
//! One saga instance owns one transfer. It accepts updates one at a time,
//! validates each before accepting it, runs the withdraw and deposit steps,
//! and reverses completed steps in reverse order when a step fails.
//!
//! ```text
//! Open ──transfer accepted──▶ Executing ──ok──▶ Completed
//!                                 │
//!                               error
//!                                 ▼
//!                           Compensating ──▶ Failed
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::activity::{self, ActivityOptions};
use crate::ledger::{self, Ledger, LedgerError, LedgerOperation};
use crate::model::{TransferRequest, Update};

mod state;
pub use state::{
    Compensation, DAILY_AMOUNT_LIMIT, SagaEvent, SagaPhase, TransferSagaState, validate_account,
};

mod error;
pub use error::{CompensationError, SagaError, UpdateError, ValidationError};

/// Tunables of a transfer saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaOptions {
    pub daily_amount_limit: f64,
    /// Options for forward steps and compensations.
    pub activity: ActivityOptions,
    /// Upper bound on the lifetime of an instance, `None` to wait forever.
    pub run_timeout: Option<Duration>,
    /// Terminate with [`SagaError::Forward`] when the forward path failed,
    /// even if every compensation succeeded.
    pub fail_on_forward_error: bool,
}

impl Default for SagaOptions {
    fn default() -> Self {
        Self {
            daily_amount_limit: DAILY_AMOUNT_LIMIT,
            activity: ActivityOptions::default(),
            run_timeout: None,
            fail_on_forward_error: false,
        }
    }
}

/// An update delivered to a saga together with the channel for its verdict.
#[derive(Debug)]
pub struct Envelope {
    update: Update,
    reply: oneshot::Sender<Result<UpdateHandle, UpdateError>>,
}

impl Envelope {
    /// Wrap `update`; the receiver resolves once the saga accepted or rejected it.
    pub fn new(update: Update) -> (Self, oneshot::Receiver<Result<UpdateHandle, UpdateError>>) {
        let (reply, verdict) = oneshot::channel();
        (Self { update, reply }, verdict)
    }
}

/// Handle on an accepted update, resolving to its execution result.
#[derive(Debug)]
pub struct UpdateHandle {
    name: &'static str,
    completion: oneshot::Receiver<Result<(), LedgerError>>,
}

impl UpdateHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the update to finish executing.
    ///
    /// For transfers this is the forward-path result; it resolves before any
    /// compensation runs.
    pub async fn outcome(self) -> Result<(), UpdateError> {
        match self.completion.await {
            Ok(result) => result.map_err(UpdateError::Failed),
            Err(_) => Err(UpdateError::Closed),
        }
    }
}

/// Final state of a saga that terminated without error.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaReport {
    pub saga_id: String,
    pub phase: SagaPhase,
    /// Forward-path error, if the transfer was rolled back.
    pub transfer_error: Option<LedgerError>,
    pub history: Vec<SagaEvent>,
}

#[derive(Debug, Clone, Copy)]
enum ForwardStep {
    Withdraw,
    Deposit,
}

type StepFuture = Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send>>;

/// The forward step currently awaiting the ledger.
struct InFlight {
    step: ForwardStep,
    request: TransferRequest,
    future: StepFuture,
    completion: oneshot::Sender<Result<(), LedgerError>>,
}

/// A single transfer saga instance.
pub struct TransferSaga {
    id: String,
    ledger: Arc<dyn Ledger>,
    options: SagaOptions,
    state: TransferSagaState,
}

/// Public API
impl TransferSaga {
    pub fn new(id: impl Into<String>, ledger: Arc<dyn Ledger>, options: SagaOptions) -> Self {
        Self {
            id: id.into(),
            ledger,
            options,
            state: TransferSagaState::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &TransferSagaState {
        &self.state
    }

    /// Run the saga until it terminates, taking updates from `updates`.
    ///
    /// Updates keep being validated while a ledger call is in flight. Once the
    /// forward path is done the stream is dropped, so later callers observe
    /// [`UpdateError::Closed`].
    pub async fn run(
        mut self,
        mut updates: impl Stream<Item = Envelope> + Unpin,
    ) -> Result<SagaReport, SagaError> {
        let mut in_flight: Option<InFlight> = None;
        let mut mailbox_open = true;

        while !self.state.transfer_done() {
            if !mailbox_open && in_flight.is_none() {
                warn!(saga_id = %self.id, "mailbox closed before a transfer was attempted");
                return Err(SagaError::Abandoned);
            }

            tokio::select! {
                biased;
                result = async {
                    match in_flight.as_mut() {
                        Some(flight) => (&mut flight.future).await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    if let Some(flight) = in_flight.take() {
                        in_flight = self.complete_step(flight, result);
                    }
                }
                envelope = updates.next(), if mailbox_open => match envelope {
                    Some(envelope) => {
                        if let Some(flight) = self.handle(envelope) {
                            in_flight = Some(flight);
                        }
                    }
                    None => mailbox_open = false,
                },
            }
        }
        drop(updates);

        self.finish().await
    }
}

/// Private API
impl TransferSaga {
    /// Validate one update and apply it when accepted.
    ///
    /// Returns the withdraw step to drive when a transfer was accepted.
    fn handle(&mut self, envelope: Envelope) -> Option<InFlight> {
        let Envelope { update, reply } = envelope;
        let name = update.name();
        let limit = self.options.daily_amount_limit;

        let accepted = match update {
            Update::SetFromAccount(account) => self.state.set_from_account(account).map(|()| None),
            Update::SetToAccount(account) => self.state.set_to_account(account).map(|()| None),
            Update::TransferAmount(amount) => {
                let request = self.state.request_for(amount);
                self.state.accept_transfer(&request, limit).map(|()| Some(request))
            }
            Update::Transfer(request) => self
                .state
                .accept_transfer(&request, limit)
                .map(|()| Some(request)),
        };

        match accepted {
            Ok(transfer) => {
                info!(saga_id = %self.id, update = name, "update accepted");
                self.state.record(SagaEvent::UpdateAccepted {
                    update: name.to_string(),
                });

                let (completion, outcome) = oneshot::channel();
                let flight = match transfer {
                    Some(request) => Some(self.start_step(ForwardStep::Withdraw, request, completion)),
                    None => {
                        let _ = completion.send(Ok(()));
                        None
                    }
                };
                let _ = reply.send(Ok(UpdateHandle {
                    name,
                    completion: outcome,
                }));
                flight
            }
            Err(e) => {
                debug!(saga_id = %self.id, update = name, reason = %e, "update rejected");
                self.state.record(SagaEvent::UpdateRejected {
                    update: name.to_string(),
                    reason: e.to_string(),
                });
                let _ = reply.send(Err(UpdateError::Rejected(e)));
                None
            }
        }
    }

    /// Register the reversal of `step` and start the step itself.
    fn start_step(
        &mut self,
        step: ForwardStep,
        request: TransferRequest,
        completion: oneshot::Sender<Result<(), LedgerError>>,
    ) -> InFlight {
        let (operation, account) = match step {
            ForwardStep::Withdraw => {
                self.state.push_compensation(Compensation::revert_withdraw(
                    &request.from_account,
                    request.amount,
                ));
                (LedgerOperation::Withdraw, request.from_account.clone())
            }
            ForwardStep::Deposit => {
                self.state.push_compensation(Compensation::revert_deposit(
                    &request.to_account,
                    request.amount,
                ));
                (LedgerOperation::Deposit, request.to_account.clone())
            }
        };

        debug!(saga_id = %self.id, %operation, %account, amount = request.amount, "starting step");
        let ledger = Arc::clone(&self.ledger);
        let options = self.options.activity.clone();
        let amount = request.amount;
        let future = Box::pin(async move {
            activity::execute(&options, operation, || {
                ledger::invoke(ledger.as_ref(), operation, &account, amount)
            })
            .await
        });

        InFlight {
            step,
            request,
            future,
            completion,
        }
    }

    /// Record the result of a forward step and move to the next one.
    fn complete_step(
        &mut self,
        flight: InFlight,
        result: Result<(), LedgerError>,
    ) -> Option<InFlight> {
        let InFlight {
            step,
            request,
            completion,
            ..
        } = flight;
        let (operation, account) = match step {
            ForwardStep::Withdraw => (LedgerOperation::Withdraw, &request.from_account),
            ForwardStep::Deposit => (LedgerOperation::Deposit, &request.to_account),
        };

        match result {
            Ok(()) => {
                self.state.record(SagaEvent::StepCompleted {
                    operation,
                    account: account.clone(),
                });
                match step {
                    ForwardStep::Withdraw => {
                        return Some(self.start_step(ForwardStep::Deposit, request, completion));
                    }
                    ForwardStep::Deposit => {
                        info!(
                            saga_id = %self.id,
                            from = %request.from_account,
                            to = %request.to_account,
                            amount = request.amount,
                            "transfer applied"
                        );
                        self.state.finish_forward(None);
                        let _ = completion.send(Ok(()));
                    }
                }
            }
            Err(e) => {
                warn!(
                    saga_id = %self.id,
                    %operation,
                    account = %account,
                    retryable = e.is_retryable(),
                    reason = %e,
                    "transfer step failed"
                );
                self.state.record(SagaEvent::StepFailed {
                    operation,
                    account: account.clone(),
                    error: e.to_string(),
                });
                self.state.finish_forward(Some(e.clone()));
                let _ = completion.send(Err(e));
            }
        }
        None
    }

    /// Terminal phase: compensate a failed transfer, then report.
    async fn finish(mut self) -> Result<SagaReport, SagaError> {
        let Some(transfer_error) = self.state.terminal_error().cloned() else {
            info!(saga_id = %self.id, "saga completed");
            return Ok(self.into_report());
        };

        let compensations = self.state.begin_compensation();
        info!(
            saga_id = %self.id,
            count = compensations.len(),
            "compensating failed transfer"
        );

        let mut failures = Vec::new();
        for compensation in compensations {
            let Compensation {
                operation,
                account,
                amount,
            } = compensation;
            let result = activity::execute(&self.options.activity, operation, || {
                ledger::invoke(self.ledger.as_ref(), operation, &account, amount)
            })
            .await;

            match result {
                Ok(()) => {
                    debug!(saga_id = %self.id, %operation, %account, "compensation applied");
                    self.state
                        .record(SagaEvent::CompensationCompleted { operation, account });
                }
                Err(source) => {
                    warn!(saga_id = %self.id, %operation, %account, reason = %source, "compensation failed");
                    self.state.record(SagaEvent::CompensationFailed {
                        operation,
                        account: account.clone(),
                        error: source.to_string(),
                    });
                    failures.push(CompensationError {
                        operation,
                        account,
                        source,
                    });
                }
            }
        }
        self.state.end_compensation();

        if !failures.is_empty() {
            return Err(SagaError::Compensation(failures));
        }
        if self.options.fail_on_forward_error {
            return Err(SagaError::Forward(transfer_error));
        }
        info!(saga_id = %self.id, "saga rolled back");
        Ok(self.into_report())
    }

    fn into_report(self) -> SagaReport {
        SagaReport {
            phase: self.state.phase(),
            transfer_error: self.state.terminal_error().cloned(),
            history: self.state.history().to_vec(),
            saga_id: self.id,
        }
    }
}
