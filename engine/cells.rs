//! # Cell Composition
//!
//! Cell-type proportions per sample, as produced by the external deconvolution routine,
//! and the normalisation that turns them into the seven features consumed by the
//! tissue-correction bank.
//!
//! The six immune cell types are renormalised to sum to one per sample. The difference
//! between the raw and renormalised proportions is the signal the correction models were
//! trained on. `B` cells are dropped from the feature set by convention.

use crate::matrix::{MatrixError, MethylationMatrix, write_labelled_csv};
use crate::shared::process::ProcessError;
use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::{CsvReadOptions, DataType, PolarsError, SerReader};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The canonical deconvolution output columns, in order.
pub const CELL_TYPES: [&str; 8] = ["Epi", "Fib", "B", "NK", "CD4T", "CD8T", "Mono", "Neutro"];

/// Positions in `CELL_TYPES` of the cell types renormalised before correction.
pub const ADJUSTABLE_CELL_TYPES: [usize; 6] = [2, 3, 4, 5, 6, 7];

/// Positions in `CELL_TYPES` of the correction features. `B` is left out.
pub const FEATURE_CELL_TYPES: [usize; 7] = [0, 1, 3, 4, 5, 6, 7];

/// Name of the sample identifier column in proportion tables.
pub const SAMPLE_ID_COLUMN: &str = "SampleID";

#[derive(Error, Debug)]
pub enum CellError {
    #[error("Cell type '{0}' is missing from the deconvolution output.")]
    MissingCellType(String),
    #[error("Proportion table shape {found:?} does not match {samples} samples x {cell_types} cell types.")]
    ShapeMismatch {
        found: (usize, usize),
        samples: usize,
        cell_types: usize,
    },
    #[error("Sample '{0}' appears more than once in the proportion table.")]
    DuplicateSample(String),
    #[error(
        "Correction features contain unresolved missing values for {} sample(s): {}",
        .0.len(),
        .0.join(", ")
    )]
    MissingFeatures(Vec<String>),
    #[error("No cell proportions were supplied for sample(s): {}", .0.join(", "))]
    MissingSamples(Vec<String>),
    #[error("Failed to serialise the proportion table: {0}")]
    Serialise(#[from] MatrixError),
    #[error("IO error while handing data to the deconvolution program: {0}")]
    Io(#[from] std::io::Error),
    #[error("Deconvolution failed: {0}")]
    Process(#[from] ProcessError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("The required column '{0}' was not found in the proportion table.")]
    ColumnNotFound(String),
}

/// Sample-by-cell-type proportions in the canonical `CELL_TYPES` order.
#[derive(Debug, Clone)]
pub struct CellProportionTable {
    sample_ids: Vec<String>,
    values: Array2<f64>,
    sample_index: AHashMap<String, usize>,
}

impl CellProportionTable {
    /// Builds a table whose columns are already in `CELL_TYPES` order.
    pub fn new(sample_ids: Vec<String>, values: Array2<f64>) -> Result<Self, CellError> {
        if values.dim() != (sample_ids.len(), CELL_TYPES.len()) {
            return Err(CellError::ShapeMismatch {
                found: values.dim(),
                samples: sample_ids.len(),
                cell_types: CELL_TYPES.len(),
            });
        }
        let mut sample_index = AHashMap::with_capacity(sample_ids.len());
        for (row, sample) in sample_ids.iter().enumerate() {
            if sample_index.insert(sample.clone(), row).is_some() {
                return Err(CellError::DuplicateSample(sample.clone()));
            }
        }
        Ok(Self {
            sample_ids,
            values,
            sample_index,
        })
    }

    /// Builds a table from arbitrarily ordered named columns, picking the canonical cell types
    /// by name. Extra columns are ignored.
    pub fn from_named_columns(
        sample_ids: Vec<String>,
        column_names: &[String],
        values: ArrayView2<'_, f64>,
    ) -> Result<Self, CellError> {
        let mut ordered = Array2::zeros((sample_ids.len(), CELL_TYPES.len()));
        for (target, cell_type) in CELL_TYPES.iter().enumerate() {
            let source = column_names
                .iter()
                .position(|name| name == cell_type)
                .ok_or_else(|| CellError::MissingCellType(cell_type.to_string()))?;
            ordered.column_mut(target).assign(&values.column(source));
        }
        Self::new(sample_ids, ordered)
    }

    /// Loads a previously saved proportion table with a `SampleID` column.
    pub fn load(path: &Path) -> Result<Self, CellError> {
        let file = File::open(path)?;
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(file)
            .finish()?;

        let column_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        if !column_names.iter().any(|name| name == SAMPLE_ID_COLUMN) {
            return Err(CellError::ColumnNotFound(SAMPLE_ID_COLUMN.to_string()));
        }

        let sample_ids: Vec<String> = df
            .column(SAMPLE_ID_COLUMN)?
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|id| id.unwrap_or_default().to_string())
            .collect();

        let mut values = Array2::from_elem((sample_ids.len(), column_names.len()), f64::NAN);
        for (col, name) in column_names.iter().enumerate() {
            if name == SAMPLE_ID_COLUMN {
                continue;
            }
            let casted = df.column(name)?.cast(&DataType::Float64)?;
            for (row, value) in casted.f64()?.into_iter().enumerate() {
                values[[row, col]] = value.unwrap_or(f64::NAN);
            }
        }

        let table = Self::from_named_columns(sample_ids, &column_names, values.view())?;
        log::info!(
            "Loaded cell proportions for {} samples from {:?}",
            table.sample_ids().len(),
            path
        );
        Ok(table)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn row(&self, sample: &str) -> Option<ArrayView1<'_, f64>> {
        self.sample_index
            .get(sample)
            .map(|&row| self.values.row(row))
    }

    pub fn to_csv_string(&self) -> Result<String, CellError> {
        let names: Vec<String> = CELL_TYPES.iter().map(|name| name.to_string()).collect();
        Ok(write_labelled_csv(
            SAMPLE_ID_COLUMN,
            &self.sample_ids,
            &names,
            self.values.view(),
        )?)
    }
}

/// The seven correction-input features per sample.
#[derive(Debug, Clone)]
pub struct CorrectionFeatures {
    pub sample_ids: Vec<String>,
    /// Shape: [n_samples, 7], columns in `FEATURE_CELL_TYPES` order.
    pub values: Array2<f64>,
}

impl CorrectionFeatures {
    pub fn names() -> Vec<String> {
        FEATURE_CELL_TYPES
            .iter()
            .map(|&idx| CELL_TYPES[idx].to_string())
            .collect()
    }

    /// The feature row of one sample.
    pub fn row(&self, sample: &str) -> Option<ArrayView1<'_, f64>> {
        self.sample_ids
            .iter()
            .position(|id| id == sample)
            .map(|row| self.values.row(row))
    }
}

/// Computes the raw-minus-renormalised delta features.
///
/// A sample whose adjustable proportions sum to zero gets normalised values of zero, so its
/// delta features equal its raw proportions. Any `NaN` left in the features is fatal.
pub fn correction_features(table: &CellProportionTable) -> Result<CorrectionFeatures, CellError> {
    let raw = table.values();
    let mut normalised = Array2::<f64>::zeros(raw.dim());

    for (row, proportions) in raw.axis_iter(Axis(0)).enumerate() {
        let sum: f64 = ADJUSTABLE_CELL_TYPES
            .iter()
            .map(|&col| proportions[col])
            .sum();
        for &col in &ADJUSTABLE_CELL_TYPES {
            let ratio = if sum == 0.0 { 0.0 } else { proportions[col] / sum };
            normalised[[row, col]] = if ratio.is_finite() { ratio } else { 0.0 };
        }
    }

    let delta = &raw - &normalised;
    let values = delta.select(Axis(1), &FEATURE_CELL_TYPES);

    let offending: Vec<String> = values
        .axis_iter(Axis(0))
        .zip(table.sample_ids())
        .filter(|(row, _)| row.iter().any(|v| v.is_nan()))
        .map(|(row, sample)| {
            log::error!("Correction features for sample '{}' contain NaN: {:?}", sample, row);
            sample.clone()
        })
        .collect();
    if !offending.is_empty() {
        return Err(CellError::MissingFeatures(offending));
    }

    Ok(CorrectionFeatures {
        sample_ids: table.sample_ids().to_vec(),
        values,
    })
}

/// A capability that estimates cell-type proportions from a methylation matrix.
///
/// The production implementation runs the external deconvolution program through
/// `shared::process`.
pub trait CellCompositionEstimator {
    fn estimate(&self, matrix: &MethylationMatrix) -> Result<CellProportionTable, CellError>;
}

/// Proportions estimated ahead of time, e.g. loaded with `CellProportionTable::load`.
///
/// Every matrix sample must have a row; extra rows are ignored.
#[derive(Debug, Clone)]
pub struct PrecomputedCells {
    pub table: CellProportionTable,
}

impl CellCompositionEstimator for PrecomputedCells {
    fn estimate(&self, matrix: &MethylationMatrix) -> Result<CellProportionTable, CellError> {
        let missing: Vec<String> = matrix
            .sample_ids()
            .iter()
            .filter(|sample| self.table.row(sample).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(CellError::MissingSamples(missing));
        }
        Ok(self.table.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn table(rows: Array2<f64>) -> CellProportionTable {
        let ids = (0..rows.nrows()).map(|i| format!("S{}", i + 1)).collect();
        CellProportionTable::new(ids, rows).unwrap()
    }

    #[test]
    fn zero_adjustable_sum_keeps_raw_proportions() {
        let proportions = table(array![[0.7, 0.3, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]]);
        let features = correction_features(&proportions).unwrap();
        assert_eq!(features.values.dim(), (1, 7));
        let raw_features = [0.7, 0.3, 0.0, 0.0, 0.0, 0.0, 0.0];
        for (got, expected) in features.values.row(0).iter().zip(raw_features) {
            assert_abs_diff_eq!(*got, expected, epsilon = 1e-15);
            assert!(got.is_finite());
        }
    }

    #[test]
    fn immune_fractions_are_renormalised() {
        // Immune cells sum to 0.5, so each normalised value is twice the raw value.
        let proportions = table(array![[0.4, 0.1, 0.1, 0.1, 0.1, 0.05, 0.1, 0.05]]);
        let features = correction_features(&proportions).unwrap();
        let row = features.values.row(0);
        assert_abs_diff_eq!(row[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(row[1], 0.1, epsilon = 1e-12);
        // NK: 0.1 - 0.2
        assert_abs_diff_eq!(row[2], -0.1, epsilon = 1e-12);
        // CD8T: 0.05 - 0.1
        assert_abs_diff_eq!(row[4], -0.05, epsilon = 1e-12);
        assert_eq!(
            CorrectionFeatures::names(),
            vec!["Epi", "Fib", "NK", "CD4T", "CD8T", "Mono", "Neutro"]
        );
    }

    #[test]
    fn already_normalised_immune_fractions_give_zero_delta() {
        let proportions = table(array![[0.0, 0.0, 0.1, 0.2, 0.3, 0.1, 0.2, 0.1]]);
        let features = correction_features(&proportions).unwrap();
        for value in features.values.row(0).iter() {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn nan_features_are_fatal() {
        let proportions = table(array![
            [0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [f64::NAN, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1]
        ]);
        match correction_features(&proportions).unwrap_err() {
            CellError::MissingFeatures(samples) => assert_eq!(samples, vec!["S2".to_string()]),
            other => panic!("Expected MissingFeatures, got {:?}", other),
        }
    }

    #[test]
    fn named_columns_are_reordered_to_canonical_order() {
        let names: Vec<String> = ["Neutro", "Mono", "CD8T", "CD4T", "NK", "B", "Fib", "Epi", "Extra"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let values = array![[8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 99.0]];
        let table =
            CellProportionTable::from_named_columns(vec!["S1".into()], &names, values.view())
                .unwrap();
        assert_eq!(
            table.row("S1").unwrap().to_vec(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn saved_table_loads_back() {
        use std::io::Write;

        let original = table(array![
            [0.4, 0.1, 0.1, 0.1, 0.1, 0.05, 0.1, 0.05],
            [0.0, 0.0, 0.1, 0.2, 0.3, 0.1, 0.2, 0.1]
        ]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", original.to_csv_string().unwrap()).unwrap();
        file.flush().unwrap();

        let loaded = CellProportionTable::load(file.path()).unwrap();
        assert_eq!(loaded.sample_ids(), original.sample_ids());
        for (got, expected) in loaded.values().iter().zip(original.values().iter()) {
            assert_abs_diff_eq!(*got, *expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn missing_cell_type_is_reported() {
        let names = vec!["Epi".to_string()];
        let values = array![[1.0]];
        let err = CellProportionTable::from_named_columns(vec!["S1".into()], &names, values.view())
            .unwrap_err();
        assert!(matches!(err, CellError::MissingCellType(ref c) if c == "Fib"));
    }

    #[test]
    fn precomputed_cells_must_cover_every_sample() {
        let proportions = table(array![
            [0.4, 0.1, 0.1, 0.1, 0.1, 0.05, 0.1, 0.05],
            [0.5, 0.1, 0.1, 0.1, 0.1, 0.0, 0.05, 0.05]
        ]);
        let estimator = PrecomputedCells { table: proportions };

        let covered = MethylationMatrix::new(
            vec!["cg01".into()],
            vec!["S2".into(), "S1".into()],
            array![[0.1, 0.2]],
        )
        .unwrap();
        assert_eq!(estimator.estimate(&covered).unwrap().sample_ids(), &["S1", "S2"]);

        let uncovered = MethylationMatrix::new(
            vec!["cg01".into()],
            vec!["S1".into(), "S9".into()],
            array![[0.1, 0.2]],
        )
        .unwrap();
        assert!(matches!(
            estimator.estimate(&uncovered).unwrap_err(),
            CellError::MissingSamples(ref missing) if missing == &["S9"]
        ));
    }
}
