//! Activity invocation: start-to-close timeout plus an explicit retry policy.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::{LedgerError, LedgerOperation};

/// Start-to-close timeout applied to each ledger call.
pub const LEDGER_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
/// Start-to-close timeout applied to local, non-durable computations.
pub const LOCAL_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(1);

/// Retry policy for retryable activity failures.
///
/// Non-retryable failures (see [`LedgerError::is_retryable`]) always end the
/// activity on the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let delay_nanos = self.initial_interval.as_nanos() as f64 * factor;
        if !delay_nanos.is_finite() || delay_nanos >= self.maximum_interval.as_nanos() as f64 {
            return self.maximum_interval;
        }
        Duration::from_nanos(delay_nanos as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
        }
    }
}

/// Options for one kind of activity invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: LEDGER_ACTIVITY_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Run a ledger operation under `options`.
///
/// `call` is invoked once per attempt. A timed out attempt counts as a
/// retryable [`LedgerError::Timeout`].
pub async fn execute<F, Fut>(
    options: &ActivityOptions,
    operation: LedgerOperation,
    mut call: F,
) -> Result<(), LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), LedgerError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(options.start_to_close_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout {
                operation,
                timeout: options.start_to_close_timeout,
            }),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < options.retry.max_attempts => {
                let delay = options.retry.backoff(attempt);
                debug!(%operation, attempt, ?delay, error = %e, "retrying activity");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
