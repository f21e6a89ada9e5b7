//! # Clock Ensemble
//!
//! Runs a list of named clocks over one matrix and concatenates their outputs column-wise.
//! Each output column is prefixed with its model name, e.g. `Horvathv2_Predicted`.
//!
//! - Preconditions are checked before any model runs: metadata must be present when a
//!   requested model needs it, and its length must match the matrix's sample count.
//! - Partial failure: an unknown model name, a failing `predict`, or an output of the wrong
//!   length is logged and skipped. The remaining models still run.

use crate::clocks::{ClockGallery, ClockModel, ClockOutput};
use crate::matrix::{MatrixError, MethylationMatrix, write_labelled_csv};
use crate::metadata::SampleMetadata;
use crate::progress::{PipelineStage, StageObserver};
use ahash::AHashSet;
use ndarray::Array2;
use thiserror::Error;

/// Name of the sample identifier column in serialised ensemble tables.
pub const SAMPLE_INDEX_COLUMN: &str = "SampleID";

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error(
        "Model '{0}' requires age and sex metadata, but none was supplied. Metadata is checked before any model runs."
    )]
    MissingMetadata(String),
    #[error("Metadata describes {found} samples but the matrix has {expected} sample columns.")]
    MetadataLength { expected: usize, found: usize },
    #[error("Two models produced the output column '{0}'.")]
    DuplicateColumn(String),
    #[error("Column '{column}' has {found} values for {expected} samples.")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("Failed to serialise the ensemble table: {0}")]
    Serialise(#[from] MatrixError),
}

/// Sample-indexed clock outputs. Column order follows the requested model order.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleTable {
    sample_ids: Vec<String>,
    columns: Vec<String>,
    /// Column-major: one vector per column, one value per sample.
    values: Vec<Vec<f64>>,
}

impl EnsembleTable {
    pub fn empty(sample_ids: Vec<String>) -> Self {
        Self {
            sample_ids,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// All values of one column in sample order.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .position(|column| column == name)
            .map(|position| self.values[position].as_slice())
    }

    /// One finite value, or `None` when the sample, the column, or the value is missing.
    pub fn get(&self, sample: &str, column: &str) -> Option<f64> {
        let row = self.sample_ids.iter().position(|id| id == sample)?;
        self.column(column)
            .and_then(|values| values.get(row).copied())
            .filter(|value| value.is_finite())
    }

    /// All columns for one sample. Non-finite values are `None`.
    pub fn sample_values(&self, sample: &str) -> Vec<(String, Option<f64>)> {
        let Some(row) = self.sample_ids.iter().position(|id| id == sample) else {
            return Vec::new();
        };
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, values)| (name.clone(), Some(values[row]).filter(|v| v.is_finite())))
            .collect()
    }

    /// Appends a column. Values must follow `sample_ids` order.
    pub fn add_column(&mut self, column: String, values: Vec<f64>) -> Result<(), EnsembleError> {
        if values.len() != self.sample_ids.len() {
            return Err(EnsembleError::ColumnLength {
                column,
                expected: self.sample_ids.len(),
                found: values.len(),
            });
        }
        if self.columns.contains(&column) {
            return Err(EnsembleError::DuplicateColumn(column));
        }
        self.columns.push(column);
        self.values.push(values);
        Ok(())
    }

    /// The columns produced by one model, e.g. every `EpigenTL_*` column.
    pub fn model_columns(&self, model: &str) -> Self {
        let prefix = format!("{model}_");
        let (columns, values): (Vec<String>, Vec<Vec<f64>>) = self
            .columns
            .iter()
            .zip(&self.values)
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, values)| (name.clone(), values.clone()))
            .unzip();
        Self {
            sample_ids: self.sample_ids.clone(),
            columns,
            values,
        }
    }

    pub fn to_csv_string(&self) -> Result<String, EnsembleError> {
        let values = Array2::from_shape_fn((self.sample_ids.len(), self.columns.len()), |(row, col)| {
            self.values[col][row]
        });
        Ok(write_labelled_csv(
            SAMPLE_INDEX_COLUMN,
            &self.sample_ids,
            &self.columns,
            values.view(),
        )?)
    }
}

fn validate_output(
    model: &dyn ClockModel,
    output: ClockOutput,
    n_samples: usize,
) -> Result<ClockOutput, String> {
    if output.columns.is_empty() {
        return Err("produced no output columns".to_string());
    }
    for (name, values) in &output.columns {
        if values.len() != n_samples {
            return Err(format!(
                "column '{}' of '{}' has {} values for {} samples",
                name,
                model.name(),
                values.len(),
                n_samples
            ));
        }
    }
    Ok(output)
}

/// Runs `models` in order against `matrix` and concatenates their prefixed outputs.
pub fn run_models(
    matrix: &MethylationMatrix,
    models: &[String],
    gallery: &ClockGallery,
    metadata: Option<&SampleMetadata>,
    stage: PipelineStage,
    observer: &mut dyn StageObserver,
) -> Result<EnsembleTable, EnsembleError> {
    if metadata.is_none() {
        let needs_metadata = models
            .iter()
            .find(|name| gallery.get(name).is_some_and(|model| model.requires_metadata()));
        if let Some(name) = needs_metadata {
            return Err(EnsembleError::MissingMetadata(name.clone()));
        }
    }
    if let Some(metadata) = metadata {
        if metadata.len() != matrix.n_samples() {
            return Err(EnsembleError::MetadataLength {
                expected: matrix.n_samples(),
                found: metadata.len(),
            });
        }
    }

    observer.on_stage_start(stage, models.len());
    let mut table = EnsembleTable::empty(matrix.sample_ids().to_vec());
    let mut seen: AHashSet<&str> = AHashSet::with_capacity(models.len());
    let mut failures = 0usize;

    for (i, name) in models.iter().enumerate() {
        if !seen.insert(name.as_str()) {
            log::warn!("Model {} was requested more than once; running it once.", name);
            observer.on_stage_advance(stage, i + 1);
            continue;
        }
        log::info!("Processing model {}: {}", i + 1, name);
        let outcome = match gallery.get(name) {
            None => Err("not found in the clock gallery".to_string()),
            Some(model) => model
                .predict(matrix, metadata)
                .map_err(|err| err.to_string())
                .and_then(|output| validate_output(model, output, matrix.n_samples())),
        };

        match outcome {
            Ok(output) => {
                for (column, values) in output.columns {
                    table.add_column(format!("{}_{}", name, column), values)?;
                }
            }
            Err(reason) => {
                log::error!("Error processing model {}: {}", name, reason);
                failures += 1;
            }
        }
        observer.on_stage_advance(stage, i + 1);
    }
    observer.on_stage_finish(stage);

    if table.is_empty() && !models.is_empty() {
        log::warn!(
            "All {} requested models failed during {}; the ensemble table is empty.",
            models.len(),
            stage
        );
    } else if failures > 0 {
        log::warn!(
            "{} of {} models failed during {} and were excluded.",
            failures,
            models.len(),
            stage
        );
    }
    Ok(table)
}
