//! # External Process Boundary
//!
//! Signal processing (raw IDAT to beta values) and cell-type deconvolution run in external
//! programs. This module is the only place that talks to them.
//!
//! - Strict Contract: the last non-empty stdout line of every invocation must be a JSON
//!   object `{"status": ..., "data": ..., "message": ...}`. Anything else is an error.
//! - No Retry: a non-zero exit or an error status is fatal for the batch. Full stderr is
//!   logged before the error is returned.

use crate::cells::{
    CELL_TYPES, CellCompositionEstimator, CellError, CellProportionTable, SAMPLE_ID_COLUMN,
};
use crate::matrix::{MatrixError, MatrixSource, MethylationMatrix};
use ndarray::Array2;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use tempfile::Builder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("External program exited with status {code:?}. Stderr:\n{stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("External program output is not a valid result line: {0}")]
    MalformedOutput(String),
    #[error("External program reported an error: {0}")]
    Failed(String),
    #[error("External program returned an unusable payload: {0}")]
    Payload(String),
}

/// Everything captured from one finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A capability that runs an external program with arguments and waits for it.
pub trait ProcessRunner {
    fn describe(&self) -> String;

    fn invoke(&self, args: &[String]) -> Result<ProcessResult, ProcessError>;
}

/// Runs `executable script args...`, e.g. `Rscript deconvolve.R input.csv`.
#[derive(Debug, Clone)]
pub struct ScriptProcess {
    pub executable: PathBuf,
    pub script: PathBuf,
}

impl ScriptProcess {
    pub fn new(executable: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
        }
    }
}

impl ProcessRunner for ScriptProcess {
    fn describe(&self) -> String {
        format!("{} {}", self.executable.display(), self.script.display())
    }

    fn invoke(&self, args: &[String]) -> Result<ProcessResult, ProcessError> {
        log::info!("Running {} with arguments {:?}", self.describe(), args);
        let output = Command::new(&self.executable)
            .arg(&self.script)
            .args(args)
            .output()
            .map_err(|source| ProcessError::Spawn {
                program: self.describe(),
                source,
            })?;
        Ok(ProcessResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

#[derive(Deserialize)]
struct ContractLine {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

/// Validates a finished invocation and returns the `data` member of its result line.
pub fn parse_contract(result: &ProcessResult) -> Result<Value, ProcessError> {
    if !result.succeeded() {
        log::error!(
            "External program exited with status {:?}. Stderr:\n{}",
            result.exit_code,
            result.stderr
        );
        return Err(ProcessError::NonZeroExit {
            code: result.exit_code,
            stderr: result.stderr.clone(),
        });
    }

    let last_line = result
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| ProcessError::MalformedOutput("no output".to_string()))?;

    let parsed: ContractLine = serde_json::from_str(last_line).map_err(|err| {
        log::error!("Failed to parse external program output as JSON: {}", err);
        log::error!("Last output line: {}", last_line);
        ProcessError::MalformedOutput(format!("{err}: {last_line}"))
    })?;

    if parsed.status != "success" {
        let message = parsed
            .message
            .unwrap_or_else(|| "Unknown error".to_string());
        log::error!("External program reported failure: {}", message);
        return Err(ProcessError::Failed(message));
    }
    Ok(parsed.data)
}

#[derive(Deserialize)]
struct BetaPayload {
    beta_table: Vec<Vec<Option<f64>>>,
    rownames: Vec<String>,
    colnames: Vec<String>,
}

/// Converts a `{beta_table, rownames, colnames}` payload into a matrix. `null` becomes `NaN`.
pub fn beta_payload_to_matrix(data: Value) -> Result<MethylationMatrix, MatrixError> {
    let payload: BetaPayload = serde_json::from_value(data)
        .map_err(|err| ProcessError::Payload(format!("beta table: {err}")))?;

    let n_samples = payload.colnames.len();
    if payload.beta_table.len() != payload.rownames.len() {
        return Err(ProcessError::Payload(format!(
            "beta table has {} rows but {} row names",
            payload.beta_table.len(),
            payload.rownames.len()
        ))
        .into());
    }

    let mut flat = Vec::with_capacity(payload.rownames.len() * n_samples);
    for (row, values) in payload.beta_table.iter().enumerate() {
        if values.len() != n_samples {
            return Err(ProcessError::Payload(format!(
                "beta table row {} has {} values but there are {} samples",
                row,
                values.len(),
                n_samples
            ))
            .into());
        }
        flat.extend(values.iter().map(|value| value.unwrap_or(f64::NAN)));
    }

    let values = Array2::from_shape_vec((payload.rownames.len(), n_samples), flat)
        .map_err(|err| ProcessError::Payload(err.to_string()))?;
    let matrix = MethylationMatrix::new(payload.rownames, payload.colnames, values)?;
    matrix.ensure_beta_range()?;
    Ok(matrix)
}

/// Converts `data.cell_proportion` records (one object per sample, keyed by cell type plus
/// `SampleID`) into a proportion table.
pub fn cell_payload_to_table(data: Value) -> Result<CellProportionTable, CellError> {
    let records: Vec<Map<String, Value>> = match data {
        Value::Object(mut object) => {
            let records = object
                .remove("cell_proportion")
                .ok_or_else(|| ProcessError::Payload("missing 'cell_proportion'".to_string()))?;
            serde_json::from_value(records)
                .map_err(|err| ProcessError::Payload(format!("cell proportions: {err}")))?
        }
        _ => {
            return Err(ProcessError::Payload("payload is not an object".to_string()).into());
        }
    };

    let mut sample_ids = Vec::with_capacity(records.len());
    let mut values = Array2::from_elem((records.len(), CELL_TYPES.len()), f64::NAN);
    for (row, record) in records.iter().enumerate() {
        let sample = record
            .get(SAMPLE_ID_COLUMN)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProcessError::Payload(format!("record {} has no {}", row, SAMPLE_ID_COLUMN))
            })?;
        sample_ids.push(sample.to_string());
        for (col, cell_type) in CELL_TYPES.iter().enumerate() {
            let value = record
                .get(*cell_type)
                .ok_or_else(|| CellError::MissingCellType(cell_type.to_string()))?;
            values[[row, col]] = value.as_f64().unwrap_or(f64::NAN);
        }
    }
    CellProportionTable::new(sample_ids, values)
}

/// Raw IDAT files turned into beta values by the external signal-processing program.
///
/// The program receives the sample sheet path followed by the IDAT directory.
pub struct IdatMatrixSource<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub idat_dir: PathBuf,
    pub sample_sheet: PathBuf,
}

impl MatrixSource for IdatMatrixSource<'_> {
    fn describe(&self) -> String {
        format!("IDAT directory {}", self.idat_dir.display())
    }

    fn load(&self) -> Result<MethylationMatrix, MatrixError> {
        let args = vec![
            self.sample_sheet.display().to_string(),
            self.idat_dir.display().to_string(),
        ];
        let result = self.runner.invoke(&args)?;
        let data = parse_contract(&result)?;
        let matrix = beta_payload_to_matrix(data)?;
        log::info!(
            "Signal processing produced {} probes for {} samples",
            matrix.n_probes(),
            matrix.n_samples()
        );
        Ok(matrix)
    }
}

/// Cell-type deconvolution through an external program.
///
/// The matrix is written to a temporary CSV file whose path is the program's only argument.
/// The file is removed when the estimate returns.
pub struct ExternalDeconvolution<R: ProcessRunner> {
    pub runner: R,
}

impl<R: ProcessRunner> CellCompositionEstimator for ExternalDeconvolution<R> {
    fn estimate(&self, matrix: &MethylationMatrix) -> Result<CellProportionTable, CellError> {
        let mut handoff = Builder::new()
            .prefix("epiclock_beta_")
            .suffix(".csv")
            .tempfile()?;
        handoff.write_all(matrix.to_csv_string()?.as_bytes())?;
        handoff.flush()?;

        let args = vec![handoff.path().display().to_string()];
        let result = self.runner.invoke(&args)?;
        let data = parse_contract(&result)?;
        let table = cell_payload_to_table(data)?;
        log::info!(
            "Deconvolution completed for {} samples",
            table.sample_ids().len()
        );
        Ok(table)
    }
}
