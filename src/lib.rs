pub mod activity;
pub mod amount;
pub mod batch;
pub mod client;
pub mod config;
pub mod csv;
pub mod ledger;
pub mod model;
pub mod saga;
pub mod schedule;

pub use amount::Amount;
pub use client::{SagaClient, SagaHandle, StartOptions};
pub use ledger::{Ledger, LedgerError, ReferenceLedger};
pub use model::{TransferRequest, Update, UpdateResponse};
pub use saga::{SagaError, SagaOptions, SagaPhase, TransferSaga, UpdateError};
