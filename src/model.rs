//! Core domain types for the transfer saga.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Update that sets the source account of a pending transfer.
pub const SET_FROM_ACCOUNT_UPDATE: &str = "set-from-account";
/// Update that sets the destination account of a pending transfer.
pub const SET_TO_ACCOUNT_UPDATE: &str = "set-to-account";
/// Update that supplies the amount and starts the transfer with the accounts set so far.
pub const TRANSFER_AMOUNT_UPDATE: &str = "transfer-amount";
/// Combined update carrying a full [`TransferRequest`].
pub const TRANSFER_UPDATE: &str = "transfer";

/// A request to move `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: String,
    pub to_account: String,
    pub amount: f64,
}

impl TransferRequest {
    pub fn new(from_account: impl Into<String>, to_account: impl Into<String>, amount: f64) -> Self {
        Self {
            from_account: from_account.into(),
            to_account: to_account.into(),
            amount,
        }
    }
}

/// An update call against a running transfer saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Update {
    SetFromAccount(String),
    SetToAccount(String),
    /// Transfer using the accounts set by the two previous updates.
    TransferAmount(f64),
    Transfer(TransferRequest),
}

/// Error decoding an update from its wire name and JSON payload.
#[derive(Debug, Error)]
pub enum UpdatePayloadError {
    #[error("unknown update '{0}'")]
    UnknownUpdate(String),

    #[error("invalid payload for update '{name}': {source}")]
    Payload {
        name: String,
        source: serde_json::Error,
    },
}

impl Update {
    /// Wire name of the update.
    pub fn name(&self) -> &'static str {
        match self {
            Update::SetFromAccount(_) => SET_FROM_ACCOUNT_UPDATE,
            Update::SetToAccount(_) => SET_TO_ACCOUNT_UPDATE,
            Update::TransferAmount(_) => TRANSFER_AMOUNT_UPDATE,
            Update::Transfer(_) => TRANSFER_UPDATE,
        }
    }

    /// Decode an update from its wire name and JSON argument.
    pub fn from_name(name: &str, payload: serde_json::Value) -> Result<Self, UpdatePayloadError> {
        let invalid = |source: serde_json::Error| UpdatePayloadError::Payload {
            name: name.to_string(),
            source,
        };
        match name {
            SET_FROM_ACCOUNT_UPDATE => serde_json::from_value(payload)
                .map(Update::SetFromAccount)
                .map_err(invalid),
            SET_TO_ACCOUNT_UPDATE => serde_json::from_value(payload)
                .map(Update::SetToAccount)
                .map_err(invalid),
            TRANSFER_AMOUNT_UPDATE => serde_json::from_value(payload)
                .map(Update::TransferAmount)
                .map_err(invalid),
            TRANSFER_UPDATE => serde_json::from_value(payload)
                .map(Update::Transfer)
                .map_err(invalid),
            other => Err(UpdatePayloadError::UnknownUpdate(other.to_string())),
        }
    }
}

/// Structured response handed back to callers at the service boundary.
///
/// Exactly one of the two fields is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub success: String,
    pub error: String,
}

impl UpdateResponse {
    pub fn success() -> Self {
        Self {
            success: "Update successful".to_string(),
            error: String::new(),
        }
    }

    pub fn failure(error: &impl std::fmt::Display) -> Self {
        Self {
            success: String::new(),
            error: error.to_string(),
        }
    }

    pub fn from_result<E: std::fmt::Display>(result: &Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(e) => Self::failure(e),
        }
    }
}
