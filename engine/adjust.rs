//! # Tissue Adjustment
//!
//! Converts a non-blood sample's methylation signal into a blood-equivalent estimate. Each
//! probe of the correction panel carries a pretrained linear model over the seven cell
//! composition features; its prediction is subtracted from the observed beta value.
//!
//! - Strict Schema: the bank's `feature_names` must match the feature order produced by
//!   `cells::correction_features`, and every model has exactly one coefficient per feature.
//! - Alignment: corrections are paired with matrix columns by sample identifier, never by
//!   position. A matrix sample without cell proportions is an error.
//! - Output: only panel probes with a model survive, and any row that is not finite after
//!   subtraction is dropped and reported.

use crate::cells::{CellError, CellProportionTable, CorrectionFeatures, correction_features};
use crate::matrix::{MatrixError, MethylationMatrix, ProbePanel};
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdjustError {
    #[error("Cell composition error: {0}")]
    Cells(#[from] CellError),
    #[error("Matrix error: {0}")]
    Matrix(#[from] MatrixError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse correction bank from TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize correction bank to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Correction bank features {found:?} do not match the expected order {expected:?}.")]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Correction model for probe '{probe}' has {found} coefficients, expected {expected}.")]
    CoefficientCount {
        probe: String,
        expected: usize,
        found: usize,
    },
    #[error("Correction bank contains more than one model for probe '{0}'.")]
    DuplicateModel(String),
    #[error("Sample '{0}' has no cell proportions, so its correction cannot be computed.")]
    MissingCellProportions(String),
}

/// A pretrained linear correction for one probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionModel {
    /// The probe identifier this model corrects.
    pub index: String,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl CorrectionModel {
    /// Predicted correction for every row of `features`.
    pub fn predict(&self, features: &Array2<f64>) -> Array1<f64> {
        let coefficients = ArrayView1::from(self.coefficients.as_slice());
        features.dot(&coefficients) + self.intercept
    }
}

/// The immutable collection of per-probe correction models, loaded once per process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionBank {
    pub feature_names: Vec<String>,
    pub models: Vec<CorrectionModel>,
    #[serde(skip)]
    by_probe: AHashMap<String, usize>,
}

impl CorrectionBank {
    pub fn new(feature_names: Vec<String>, models: Vec<CorrectionModel>) -> Result<Self, AdjustError> {
        let mut bank = Self {
            feature_names,
            models,
            by_probe: AHashMap::new(),
        };
        bank.validate()?;
        Ok(bank)
    }

    /// Checks the feature order and coefficient counts, and builds the probe index.
    fn validate(&mut self) -> Result<(), AdjustError> {
        let expected = CorrectionFeatures::names();
        if self.feature_names != expected {
            return Err(AdjustError::FeatureMismatch {
                expected,
                found: self.feature_names.clone(),
            });
        }

        let mut by_probe = AHashMap::with_capacity(self.models.len());
        for (position, model) in self.models.iter().enumerate() {
            if model.coefficients.len() != self.feature_names.len() {
                return Err(AdjustError::CoefficientCount {
                    probe: model.index.clone(),
                    expected: self.feature_names.len(),
                    found: model.coefficients.len(),
                });
            }
            if by_probe.insert(model.index.clone(), position).is_some() {
                return Err(AdjustError::DuplicateModel(model.index.clone()));
            }
        }
        self.by_probe = by_probe;
        Ok(())
    }

    pub fn get(&self, probe: &str) -> Option<&CorrectionModel> {
        self.by_probe.get(probe).map(|&position| &self.models[position])
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Saves the bank to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), AdjustError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates a bank from a TOML file.
    pub fn load(path: &Path) -> Result<Self, AdjustError> {
        let toml_string = fs::read_to_string(path)?;
        let mut bank: Self = toml::from_str(&toml_string)?;
        bank.validate()?;
        log::info!(
            "Loaded correction bank with {} probe models from {:?}",
            bank.len(),
            path
        );
        Ok(bank)
    }
}

/// The tissue-adjusted matrix and the panel probes that did not make it.
#[derive(Debug, Clone)]
pub struct AdjustedMatrix {
    pub matrix: MethylationMatrix,
    /// Panel probes without a correction model.
    pub uncorrected_probes: Vec<String>,
    /// Corrected probes dropped because a value was not finite after subtraction.
    pub non_finite_probes: Vec<String>,
}

/// Applies the correction bank to `methylation` restricted to `panel`.
pub fn adjust(
    methylation: &MethylationMatrix,
    cells: &CellProportionTable,
    bank: &CorrectionBank,
    panel: &ProbePanel,
) -> Result<AdjustedMatrix, AdjustError> {
    let restricted = methylation.restrict_to(panel);
    if restricted.n_probes() == 0 {
        log::warn!(
            "None of the {} matrix probes belong to the {}-probe correction panel; the adjusted matrix is empty.",
            methylation.n_probes(),
            panel.len()
        );
    }

    let features = correction_features(cells)?;

    // Feature rows in matrix column order.
    let mut aligned = Array2::<f64>::zeros((restricted.n_samples(), features.values.ncols()));
    for (col, sample) in restricted.sample_ids().iter().enumerate() {
        let row = features
            .row(sample)
            .ok_or_else(|| AdjustError::MissingCellProportions(sample.clone()))?;
        aligned.row_mut(col).assign(&row);
    }

    let mut probe_ids = Vec::with_capacity(restricted.n_probes());
    let mut corrected_rows = Vec::with_capacity(restricted.n_probes());
    let mut uncorrected_probes = Vec::new();
    for (probe, observed) in restricted.probe_ids().iter().zip(restricted.values().rows()) {
        let Some(model) = bank.get(probe) else {
            uncorrected_probes.push(probe.clone());
            continue;
        };
        probe_ids.push(probe.clone());
        corrected_rows.push(&observed - &model.predict(&aligned));
    }

    let mut values = Array2::<f64>::zeros((probe_ids.len(), restricted.n_samples()));
    for (mut target, row) in values.rows_mut().into_iter().zip(&corrected_rows) {
        target.assign(row);
    }
    let corrected = MethylationMatrix::new(probe_ids, restricted.sample_ids().to_vec(), values)?;
    let (matrix, non_finite_probes) = corrected.retain_rows(|row| row.iter().all(|v| v.is_finite()));

    if !uncorrected_probes.is_empty() {
        log::warn!(
            "{} panel probes have no correction model and were dropped.",
            uncorrected_probes.len()
        );
    }
    if !non_finite_probes.is_empty() {
        log::info!(
            "Dropped {} probes with missing values after correction.",
            non_finite_probes.len()
        );
    }
    log::info!(
        "Tissue adjustment produced {} probes for {} samples",
        matrix.n_probes(),
        matrix.n_samples()
    );

    Ok(AdjustedMatrix {
        matrix,
        uncorrected_probes,
        non_finite_probes,
    })
}
