use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::batch::BatchReport;
use crate::model::TransferRequest;

/// Errors that can occur when reading requests or writing outcomes
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: transfer missing amount")]
    MissingAmount { line: usize },

    #[error("failed to write outcome: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush outcomes: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    from_account: String,
    to_account: String,
    amount: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    workflow_id: &'a str,
    from_account: &'a str,
    to_account: &'a str,
    amount: String,
    status: &'static str,
    error: String,
}

/// Read transfer requests from a csv file with a
/// `from_account,to_account,amount` header
pub fn read_requests(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<TransferRequest, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let amount = row.amount.ok_or(CsvError::MissingAmount { line })?;
            Ok(TransferRequest::new(row.from_account, row.to_account, amount))
        }))
}

/// Write one csv row per processed request of `report`
pub fn write_outcomes(writer: impl io::Write, report: &BatchReport) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for outcome in &report.outcomes {
        let row = OutputRow {
            workflow_id: &outcome.saga_id,
            from_account: &outcome.request.from_account,
            to_account: &outcome.request.to_account,
            amount: format!("{:.2}", outcome.request.amount),
            status: outcome.status(),
            error: outcome
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
