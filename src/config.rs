//! Runtime configuration, read from `TRANSFER_SAGA_*` environment variables.
//!
//! Every variable is optional; unset variables keep the reference defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchFailurePolicy, BatchOptions};
use crate::saga::SagaOptions;

pub const DAILY_LIMIT_VAR: &str = "TRANSFER_SAGA_DAILY_LIMIT";
pub const LEDGER_TIMEOUT_MS_VAR: &str = "TRANSFER_SAGA_LEDGER_TIMEOUT_MS";
pub const RETRY_ATTEMPTS_VAR: &str = "TRANSFER_SAGA_RETRY_ATTEMPTS";
pub const RUN_TIMEOUT_MS_VAR: &str = "TRANSFER_SAGA_RUN_TIMEOUT_MS";
pub const FAIL_ON_FORWARD_ERROR_VAR: &str = "TRANSFER_SAGA_FAIL_ON_FORWARD_ERROR";
pub const TASK_QUEUE_VAR: &str = "TRANSFER_SAGA_TASK_QUEUE";
pub const BATCH_COOLDOWN_MS_VAR: &str = "TRANSFER_SAGA_BATCH_COOLDOWN_MS";
pub const BATCH_RUN_TIMEOUT_MS_VAR: &str = "TRANSFER_SAGA_BATCH_RUN_TIMEOUT_MS";
pub const BATCH_FAILURE_POLICY_VAR: &str = "TRANSFER_SAGA_BATCH_FAILURE_POLICY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub saga: SagaOptions,
    pub batch: BatchOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(limit) = parse::<f64>(&lookup, DAILY_LIMIT_VAR)? {
            config.saga.daily_amount_limit = limit;
        }
        if let Some(ms) = parse::<u64>(&lookup, LEDGER_TIMEOUT_MS_VAR)? {
            config.saga.activity.start_to_close_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, RETRY_ATTEMPTS_VAR)? {
            config.saga.activity.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&lookup, RUN_TIMEOUT_MS_VAR)? {
            config.saga.run_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(fail) = parse::<bool>(&lookup, FAIL_ON_FORWARD_ERROR_VAR)? {
            config.saga.fail_on_forward_error = fail;
        }
        if let Some(task_queue) = lookup(TASK_QUEUE_VAR) {
            config.batch.task_queue = task_queue;
        }
        if let Some(ms) = parse::<u64>(&lookup, BATCH_COOLDOWN_MS_VAR)? {
            config.batch.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, BATCH_RUN_TIMEOUT_MS_VAR)? {
            config.batch.saga_run_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = parse::<BatchFailurePolicy>(&lookup, BATCH_FAILURE_POLICY_VAR)? {
            config.batch.failure_policy = policy;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limit = self.saga.daily_amount_limit;
        if !limit.is_finite() || limit <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "daily amount limit must be positive, got {limit}"
            )));
        }
        if self.saga.activity.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.saga.activity.start_to_close_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "ledger timeout must not be zero".to_string(),
            ));
        }
        if self.batch.task_queue.is_empty() {
            return Err(ConfigError::Validation("task queue must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}
