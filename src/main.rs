use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use transfer_saga::batch::{BatchError, BatchFailurePolicy, BatchOrchestrator};
use transfer_saga::client::StartError;
use transfer_saga::config::{Config, ConfigError};
use transfer_saga::csv::{CsvError, read_requests, write_outcomes};
use transfer_saga::schedule::{self, InMemoryScheduler};
use transfer_saga::{ReferenceLedger, SagaClient, StartOptions, TransferRequest, Update, UpdateResponse};

#[derive(Debug, Error)]
enum CliError {
    #[error("usage: transfer-saga <demo | batch <batch-id> [requests.csv] | schedule>")]
    Usage,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Csv(#[from] CsvError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<(), CliError> {
    let config = Config::from_env()?;
    let client = SagaClient::new(Arc::new(ReferenceLedger), config.saga.clone());

    match args.first().map(String::as_str) {
        Some("demo") => demo(&client).await,
        Some("batch") => {
            let batch_id = args.get(1).ok_or(CliError::Usage)?;
            batch(client, config, batch_id, args.get(2)).await
        }
        Some("schedule") => register_schedules().await,
        _ => Err(CliError::Usage),
    }
}

/// Two transfers: the first one hits a frozen account, the second goes through.
async fn demo(client: &SagaClient) -> Result<(), CliError> {
    let transfers = [
        ("transfer-1", "to-account-id-piggy-bank"),
        ("transfer-2", "to-account-id"),
    ];

    for (id, to_account) in transfers {
        let handle = client.start_transfer(StartOptions::new(id)).await?;
        let request = TransferRequest::new("from-account-id", to_account, 10.0);
        let result = handle.update_and_wait(Update::Transfer(request)).await;
        if let Err(e) = &result {
            warn!(saga_id = id, reason = %e, "update failed");
        }
        println!("{}", serde_json::to_string(&UpdateResponse::from_result(&result))?);

        match handle.result().await {
            Ok(report) => info!(saga_id = id, phase = ?report.phase, "saga finished"),
            Err(e) => warn!(saga_id = id, reason = %e, "saga failed"),
        }
    }
    Ok(())
}

async fn batch(
    client: SagaClient,
    config: Config,
    batch_id: &str,
    path: Option<&String>,
) -> Result<(), CliError> {
    let failure_policy = config.batch.failure_policy;
    let orchestrator = BatchOrchestrator::new(batch_id, client, config.batch);

    let report = match path {
        Some(path) => {
            if !path.ends_with(".csv") {
                warn!(%path, "input file seems to not be a csv file");
            }
            let mut requests = Vec::new();
            for result in read_requests(path)? {
                match result {
                    Ok(request) => requests.push(request),
                    Err(e) => warn!("{e}"),
                }
            }
            orchestrator.run(requests).await
        }
        None => orchestrator.run_generated().await?,
    };

    write_outcomes(io::stdout().lock(), &report)?;

    if failure_policy == BatchFailurePolicy::Abort {
        if let Some(e) = report.outcomes.into_iter().find_map(|o| o.error) {
            return Err(e.into());
        }
    }
    Ok(())
}

async fn register_schedules() -> Result<(), CliError> {
    let scheduler = InMemoryScheduler::new();
    schedule::register_all(&scheduler, schedule::default_definitions()).await;
    println!("{}", serde_json::to_string_pretty(&scheduler.list().await)?);
    Ok(())
}
