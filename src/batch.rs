//! Batch orchestrator: generates transfer requests and drives one saga per
//! request, strictly one after the other.

use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::activity::LOCAL_ACTIVITY_TIMEOUT;
use crate::client::{DEFAULT_TASK_QUEUE, SagaClient, StartError, StartOptions};
use crate::model::{TransferRequest, Update};
use crate::saga::UpdateError;

/// Number of requests in a generated batch.
pub const BATCH_SIZE: usize = 10;
/// Amount moved by every generated request.
pub const BATCH_TRANSFER_AMOUNT: f64 = 10.0;

/// Generate a batch of [`BATCH_SIZE`] requests from `rng`.
///
/// Source accounts are `from-account-1..=50`, destinations
/// `to-account-51..=100`.
pub fn generate_batch<R: Rng + ?Sized>(rng: &mut R) -> Vec<TransferRequest> {
    (0..BATCH_SIZE)
        .map(|_| {
            TransferRequest::new(
                format!("from-account-{}", rng.gen_range(1..=50)),
                format!("to-account-{}", rng.gen_range(51..=100)),
                BATCH_TRANSFER_AMOUNT,
            )
        })
        .collect()
}

/// Deterministic random stream for a batch, seeded from its id.
pub fn seeded_rng(batch_id: &str) -> StdRng {
    let hash = Sha256::digest(batch_id.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    StdRng::seed_from_u64(u64::from_le_bytes(seed))
}

/// Id of the saga instance running `request` within batch `batch_id`.
pub fn saga_id(batch_id: &str, request: &TransferRequest) -> String {
    format!(
        "{}_{}_{}_${:.2}",
        batch_id, request.from_account, request.to_account, request.amount
    )
}

/// What to do with the remaining requests once one of them failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Stop the batch at the first failed request.
    #[default]
    Abort,
    /// Record the failure and move on to the next request.
    Continue,
}

#[derive(Debug, Error)]
#[error("unknown batch failure policy: {0}")]
pub struct UnknownPolicy(String);

impl FromStr for BatchFailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(BatchFailurePolicy::Abort),
            "continue" => Ok(BatchFailurePolicy::Continue),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub task_queue: String,
    /// Pause after each request.
    pub cooldown: Duration,
    /// Run timeout of every saga started by the batch.
    pub saga_run_timeout: Duration,
    pub generator_timeout: Duration,
    pub failure_policy: BatchFailurePolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            cooldown: Duration::from_secs(1),
            saga_run_timeout: Duration::from_secs(30),
            generator_timeout: LOCAL_ACTIVITY_TIMEOUT,
            failure_policy: BatchFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch request generation timed out after {0:?}")]
    GenerationTimedOut(Duration),

    #[error("batch request generation failed: {0}")]
    GenerationFailed(String),

    #[error("failed to start saga {saga_id}: {source}")]
    Start {
        saga_id: String,
        #[source]
        source: StartError,
    },

    #[error("transfer {saga_id} failed: {source}")]
    Transfer {
        saga_id: String,
        #[source]
        source: UpdateError,
    },
}

/// Result of one request of a batch.
#[derive(Debug)]
pub struct TransferOutcome {
    pub saga_id: String,
    pub request: TransferRequest,
    pub error: Option<BatchError>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> &'static str {
        if self.is_success() { "ok" } else { "failed" }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: String,
    /// One entry per request that was processed, in order.
    pub outcomes: Vec<TransferOutcome>,
    /// True when the batch stopped before its last request.
    pub aborted: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn first_error(&self) -> Option<&BatchError> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }
}

/// Run `generator` on the blocking pool, giving up after `limit`.
async fn run_generator<F>(limit: Duration, generator: F) -> Result<Vec<TransferRequest>, BatchError>
where
    F: FnOnce() -> Vec<TransferRequest> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(generator)).await {
        Ok(Ok(requests)) => Ok(requests),
        Ok(Err(e)) => Err(BatchError::GenerationFailed(e.to_string())),
        Err(_) => Err(BatchError::GenerationTimedOut(limit)),
    }
}

pub struct BatchOrchestrator {
    id: String,
    client: SagaClient,
    options: BatchOptions,
}

impl BatchOrchestrator {
    pub fn new(id: impl Into<String>, client: SagaClient, options: BatchOptions) -> Self {
        Self {
            id: id.into(),
            client,
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generate this batch's requests. The same batch id always yields the
    /// same requests.
    pub async fn generate(&self) -> Result<Vec<TransferRequest>, BatchError> {
        let mut rng = seeded_rng(&self.id);
        run_generator(self.options.generator_timeout, move || {
            generate_batch(&mut rng)
        })
        .await
    }

    /// Generate the batch, then run it.
    pub async fn run_generated(&self) -> Result<BatchReport, BatchError> {
        let requests = self.generate().await?;
        Ok(self.run(requests).await)
    }

    /// Run one saga per request, in order, pausing for the cool-down after
    /// each of them.
    pub async fn run(&self, requests: Vec<TransferRequest>) -> BatchReport {
        let total = requests.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut aborted = false;

        for (index, request) in requests.into_iter().enumerate() {
            let saga_id = saga_id(&self.id, &request);
            let result = self.transfer(&saga_id, &request).await;
            if !self.options.cooldown.is_zero() {
                tokio::time::sleep(self.options.cooldown).await;
            }

            match &result {
                Ok(()) => info!(batch_id = %self.id, %saga_id, "transfer succeeded"),
                Err(e) => warn!(batch_id = %self.id, %saga_id, reason = %e, "transfer failed"),
            }
            let failed = result.is_err();
            outcomes.push(TransferOutcome {
                saga_id,
                request,
                error: result.err(),
            });

            if failed && self.options.failure_policy == BatchFailurePolicy::Abort {
                aborted = index + 1 < total;
                break;
            }
        }

        let report = BatchReport {
            batch_id: self.id.clone(),
            outcomes,
            aborted,
        };
        info!(
            batch_id = %self.id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            aborted,
            "batch finished"
        );
        report
    }

    async fn transfer(&self, saga_id: &str, request: &TransferRequest) -> Result<(), BatchError> {
        let start = StartOptions::new(saga_id)
            .task_queue(self.options.task_queue.clone())
            .run_timeout(self.options.saga_run_timeout);
        let handle = self
            .client
            .start_transfer(start)
            .await
            .map_err(|source| BatchError::Start {
                saga_id: saga_id.to_string(),
                source,
            })?;

        handle
            .update_and_wait(Update::Transfer(request.clone()))
            .await
            .map_err(|source| BatchError::Transfer {
                saga_id: saga_id.to_string(),
                source,
            })
    }
}
