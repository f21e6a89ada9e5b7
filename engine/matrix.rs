//! # Methylation Matrix Loading and Validation
//!
//! This module is the entry point for beta-value data. It reads probe-by-sample tables,
//! validates them against a strict shape contract, and hands the rest of the pipeline a
//! `MethylationMatrix`: a dense `ndarray` block with ordered probe and sample identifiers.
//!
//! - Strict Schema: the probe identifier column is always named `probeID`. Every other
//!   column is a sample.
//! - Stable Identity: probe and sample identifiers are unique, and derived matrices never
//!   reorder sample columns. Later stages rely on that ordering to pair samples with their
//!   metadata.
//! - Missing Data: absent or `NA` cells are carried as `NaN`. Finite values must be valid
//!   beta values in `[0, 1]`.

use crate::shared::process::ProcessError;
use crate::shared::storage::{ObjectStore, StorageError};
use ahash::{AHashMap, AHashSet};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use polars::io::mmap::MmapBytesReader;
use polars::prelude::*;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the identifier column in every beta table.
pub const PROBE_ID_COLUMN: &str = "probeID";

/// A comprehensive error type for all matrix loading and validation failures.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(
        "The required column '{0}' was not found in the methylation table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "Sample column '{column_name}' could not be read as numeric beta values. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Probe identifier '{0}' appears more than once.")]
    DuplicateProbe(String),
    #[error("Sample identifier '{0}' appears more than once.")]
    DuplicateSample(String),
    #[error("The probe identifier column has a missing value at row {0}.")]
    MissingProbeId(usize),
    #[error("Beta value {value} for probe '{probe}' in sample '{sample}' lies outside [0, 1].")]
    OutOfRange {
        probe: String,
        sample: String,
        value: f64,
    },
    #[error("Matrix shape {found:?} does not match {probes} probes x {samples} samples.")]
    ShapeMismatch {
        found: (usize, usize),
        probes: usize,
        samples: usize,
    },
    #[error("The methylation table has no sample columns.")]
    NoSamples,
    #[error("Signal processing failed: {0}")]
    Process(#[from] ProcessError),
}

/// A probe-by-sample matrix of beta values.
///
/// Rows are probes, columns are samples. The probe index is kept alongside the data so
/// lookups by probe identifier stay O(1) across stages.
#[derive(Debug, Clone)]
pub struct MethylationMatrix {
    probe_ids: Vec<String>,
    sample_ids: Vec<String>,
    values: Array2<f64>,
    probe_index: AHashMap<String, usize>,
}

impl MethylationMatrix {
    /// Builds a matrix after checking the shape and identifier uniqueness.
    pub fn new(
        probe_ids: Vec<String>,
        sample_ids: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, MatrixError> {
        if values.dim() != (probe_ids.len(), sample_ids.len()) {
            return Err(MatrixError::ShapeMismatch {
                found: values.dim(),
                probes: probe_ids.len(),
                samples: sample_ids.len(),
            });
        }

        let mut seen_samples = AHashSet::with_capacity(sample_ids.len());
        for sample in &sample_ids {
            if !seen_samples.insert(sample.as_str()) {
                return Err(MatrixError::DuplicateSample(sample.clone()));
            }
        }

        let mut probe_index = AHashMap::with_capacity(probe_ids.len());
        for (row, probe) in probe_ids.iter().enumerate() {
            if probe_index.insert(probe.clone(), row).is_some() {
                return Err(MatrixError::DuplicateProbe(probe.clone()));
            }
        }

        Ok(Self {
            probe_ids,
            sample_ids,
            values,
            probe_index,
        })
    }

    pub fn probe_ids(&self) -> &[String] {
        &self.probe_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn n_probes(&self) -> usize {
        self.probe_ids.len()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn contains_probe(&self, probe: &str) -> bool {
        self.probe_index.contains_key(probe)
    }

    /// The beta values of one probe across all samples, in sample order.
    pub fn probe_values(&self, probe: &str) -> Option<ArrayView1<'_, f64>> {
        self.probe_index
            .get(probe)
            .map(|&row| self.values.row(row))
    }

    pub fn get(&self, probe: &str, sample_idx: usize) -> Option<f64> {
        let row = *self.probe_index.get(probe)?;
        self.values.get((row, sample_idx)).copied()
    }

    /// Keeps only rows whose identifier belongs to `panel`. Row order follows this matrix.
    pub fn restrict_to(&self, panel: &ProbePanel) -> Self {
        let rows: Vec<usize> = self
            .probe_ids
            .iter()
            .enumerate()
            .filter(|(_, probe)| panel.contains(probe))
            .map(|(row, _)| row)
            .collect();
        self.select_rows(&rows)
    }

    /// Splits the matrix into rows that pass `keep` and the identifiers of those that do not.
    pub fn retain_rows<F>(&self, keep: F) -> (Self, Vec<String>)
    where
        F: Fn(ArrayView1<'_, f64>) -> bool,
    {
        let mut kept = Vec::with_capacity(self.n_probes());
        let mut dropped = Vec::new();
        for (row, values) in self.values.axis_iter(Axis(0)).enumerate() {
            if keep(values) {
                kept.push(row);
            } else {
                dropped.push(self.probe_ids[row].clone());
            }
        }
        (self.select_rows(&kept), dropped)
    }

    /// Rejects values outside the beta range. `NaN` marks a missing value and passes.
    pub fn ensure_beta_range(&self) -> Result<(), MatrixError> {
        for ((row, col), &value) in self.values.indexed_iter() {
            if !value.is_nan() && !(0.0..=1.0).contains(&value) {
                return Err(MatrixError::OutOfRange {
                    probe: self.probe_ids[row].clone(),
                    sample: self.sample_ids[col].clone(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Serialises the matrix as CSV with a leading `probeID` column. Missing values are empty.
    pub fn to_csv_string(&self) -> Result<String, MatrixError> {
        write_labelled_csv(
            PROBE_ID_COLUMN,
            &self.probe_ids,
            &self.sample_ids,
            self.values.view(),
        )
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        let values = self.values.select(Axis(0), rows);
        let probe_ids: Vec<String> = rows.iter().map(|&row| self.probe_ids[row].clone()).collect();
        let probe_index = probe_ids
            .iter()
            .enumerate()
            .map(|(row, probe)| (probe.clone(), row))
            .collect();
        Self {
            probe_ids,
            sample_ids: self.sample_ids.clone(),
            values,
            probe_index,
        }
    }
}

/// An ordered, de-duplicated set of probe identifiers.
#[derive(Debug, Clone, Default)]
pub struct ProbePanel {
    probes: Vec<String>,
    members: AHashSet<String>,
}

impl ProbePanel {
    pub fn new<I, S>(probes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut panel = Self::default();
        for probe in probes {
            let probe = probe.into();
            if panel.members.insert(probe.clone()) {
                panel.probes.push(probe);
            }
        }
        panel
    }

    /// Reads a headerless, single-column probe list.
    pub fn load(path: &Path) -> Result<Self, MatrixError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut probes = Vec::new();
        for record in reader.records() {
            let record = record?;
            if let Some(field) = record.get(0).map(str::trim).filter(|f| !f.is_empty()) {
                probes.push(field.to_string());
            }
        }
        log::info!("Loaded probe panel with {} probes from {:?}", probes.len(), path);
        Ok(Self::new(probes))
    }

    pub fn contains(&self, probe: &str) -> bool {
        self.members.contains(probe)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.probes.iter().map(String::as_str)
    }
}

/// A capability that produces the batch's methylation matrix.
///
/// The pipeline is parameterised over the source instead of being specialised per input
/// format.
pub trait MatrixSource {
    /// A short human-readable label used in logs.
    fn describe(&self) -> String;

    fn load(&self) -> Result<MethylationMatrix, MatrixError>;
}

/// A pre-processed beta table on the local filesystem.
#[derive(Debug, Clone)]
pub struct CsvMatrixSource {
    pub path: PathBuf,
}

impl CsvMatrixSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MatrixSource for CsvMatrixSource {
    fn describe(&self) -> String {
        format!("beta table {}", self.path.display())
    }

    fn load(&self) -> Result<MethylationMatrix, MatrixError> {
        log::info!("Loading methylation matrix from {:?}", self.path);
        let file = File::open(&self.path)?;
        read_beta_table(file)
    }
}

/// A pre-processed beta table held in object storage.
pub struct StoredMatrixSource<'a> {
    pub store: &'a dyn ObjectStore,
    pub path: String,
}

impl MatrixSource for StoredMatrixSource<'_> {
    fn describe(&self) -> String {
        format!("stored beta table {}", self.path)
    }

    fn load(&self) -> Result<MethylationMatrix, MatrixError> {
        log::info!("Downloading methylation matrix from object storage: {}", self.path);
        let text = self.store.download_as_text(&self.path)?;
        read_beta_table(Cursor::new(text.into_bytes()))
    }
}

/// Parses a comma-separated beta table with a `probeID` column.
pub fn read_beta_table<R: MmapBytesReader>(reader: R) -> Result<MethylationMatrix, MatrixError> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .map_parse_options(|options| {
            options
                .with_separator(b',')
                .with_null_values(Some(NullValues::AllColumnsSingle("NA".into())))
        })
        .into_reader_with_file_handle(reader)
        .finish()?;

    log::info!(
        "Read beta table with {} rows and {} columns",
        df.height(),
        df.width()
    );
    frame_to_matrix(&df)
}

fn frame_to_matrix(df: &DataFrame) -> Result<MethylationMatrix, MatrixError> {
    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.as_str().to_string())
        .collect();

    if !column_names.iter().any(|name| name == PROBE_ID_COLUMN) {
        return Err(MatrixError::ColumnNotFound(PROBE_ID_COLUMN.to_string()));
    }

    let probe_column = df.column(PROBE_ID_COLUMN)?.cast(&DataType::String)?;
    let probe_ids = probe_column
        .str()?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            value
                .map(|id| id.trim().to_string())
                .ok_or(MatrixError::MissingProbeId(row))
        })
        .collect::<Result<Vec<String>, MatrixError>>()?;

    let sample_ids: Vec<String> = column_names
        .into_iter()
        .filter(|name| name != PROBE_ID_COLUMN)
        .collect();
    if sample_ids.is_empty() {
        return Err(MatrixError::NoSamples);
    }

    let mut values = Array2::from_elem((probe_ids.len(), sample_ids.len()), f64::NAN);
    for (col, sample) in sample_ids.iter().enumerate() {
        let column = df.column(sample)?;
        let wrong_type = || MatrixError::ColumnWrongType {
            column_name: sample.clone(),
            found_type: format!("{:?}", column.dtype()),
        };
        let casted = column.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        // A non-strict cast turns unparsable text into nulls.
        if casted.null_count() > column.null_count() {
            return Err(wrong_type());
        }
        for (row, value) in casted.f64()?.into_iter().enumerate() {
            values[[row, col]] = value.unwrap_or(f64::NAN);
        }
    }

    let matrix = MethylationMatrix::new(probe_ids, sample_ids, values)?;
    matrix.ensure_beta_range()?;
    Ok(matrix)
}

/// Writes a labelled numeric table as CSV. `NaN` cells are written as empty fields.
pub fn write_labelled_csv(
    index_name: &str,
    row_ids: &[String],
    column_names: &[String],
    values: ArrayView2<'_, f64>,
) -> Result<String, MatrixError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = Vec::with_capacity(column_names.len() + 1);
    header.push(index_name.to_string());
    header.extend(column_names.iter().cloned());
    writer.write_record(&header)?;

    for (row_id, row) in row_ids.iter().zip(values.axis_iter(Axis(0))) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(row_id.clone());
        record.extend(row.iter().map(|value| {
            if value.is_nan() {
                String::new()
            } else {
                value.to_string()
            }
        }));
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| MatrixError::Io(err.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|err| MatrixError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    fn small_matrix() -> MethylationMatrix {
        MethylationMatrix::new(
            vec!["cg01".into(), "cg02".into(), "cg03".into()],
            vec!["S1".into(), "S2".into()],
            array![[0.1, 0.2], [0.3, 0.4], [0.5, f64::NAN]],
        )
        .unwrap()
    }

    #[test]
    fn loads_probe_by_sample_table() {
        let file = create_test_csv("probeID,S1,S2\ncg01,0.1,0.9\ncg02,0.25,NA\ncg03,,0.5\n");
        let matrix = CsvMatrixSource::new(file.path()).load().unwrap();

        assert_eq!(matrix.probe_ids(), &["cg01", "cg02", "cg03"]);
        assert_eq!(matrix.sample_ids(), &["S1", "S2"]);
        assert_abs_diff_eq!(matrix.get("cg01", 1).unwrap(), 0.9, epsilon = 1e-12);
        assert!(matrix.get("cg02", 1).unwrap().is_nan());
        assert!(matrix.get("cg03", 0).unwrap().is_nan());
    }

    #[test]
    fn missing_probe_column_is_rejected() {
        let file = create_test_csv("probe,S1\ncg01,0.1\n");
        let err = CsvMatrixSource::new(file.path()).load().unwrap_err();
        match err {
            MatrixError::ColumnNotFound(col) => assert_eq!(col, PROBE_ID_COLUMN),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn out_of_range_beta_is_rejected() {
        let file = create_test_csv("probeID,S1\ncg01,1.5\n");
        let err = CsvMatrixSource::new(file.path()).load().unwrap_err();
        assert!(matches!(err, MatrixError::OutOfRange { value, .. } if value == 1.5));
    }

    #[test]
    fn non_numeric_sample_column_is_rejected() {
        let file = create_test_csv("probeID,S1\ncg01,high\ncg02,0.2\n");
        let err = CsvMatrixSource::new(file.path()).load().unwrap_err();
        assert!(matches!(err, MatrixError::ColumnWrongType { ref column_name, .. } if column_name == "S1"));
    }

    #[test]
    fn duplicate_probes_are_rejected() {
        let err = MethylationMatrix::new(
            vec!["cg01".into(), "cg01".into()],
            vec!["S1".into()],
            array![[0.1], [0.2]],
        )
        .unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateProbe(ref p) if p == "cg01"));
    }

    #[test]
    fn restrict_keeps_matrix_order() {
        let matrix = small_matrix();
        let panel = ProbePanel::new(["cg03", "cg01", "cg99"]);
        let restricted = matrix.restrict_to(&panel);
        assert_eq!(restricted.probe_ids(), &["cg01", "cg03"]);
        assert_eq!(restricted.sample_ids(), matrix.sample_ids());
        assert_abs_diff_eq!(restricted.get("cg03", 0).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn retain_rows_reports_dropped_probes() {
        let matrix = small_matrix();
        let (kept, dropped) = matrix.retain_rows(|row| row.iter().all(|v| v.is_finite()));
        assert_eq!(kept.probe_ids(), &["cg01", "cg02"]);
        assert_eq!(dropped, vec!["cg03".to_string()]);
    }

    #[test]
    fn csv_serialisation_reads_back() {
        let matrix = small_matrix();
        let text = matrix.to_csv_string().unwrap();
        assert!(text.starts_with("probeID,S1,S2\n"));
        let reread = read_beta_table(Cursor::new(text.into_bytes())).unwrap();
        assert_eq!(reread.probe_ids(), matrix.probe_ids());
        assert!(reread.get("cg03", 1).unwrap().is_nan());
        assert_abs_diff_eq!(reread.get("cg02", 1).unwrap(), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn probe_panel_reads_headerless_list() {
        let file = create_test_csv("cg01\ncg02\n\ncg01\n");
        let panel = ProbePanel::load(file.path()).unwrap();
        assert_eq!(panel.len(), 2);
        assert!(panel.contains("cg02"));
        assert_eq!(panel.iter().collect::<Vec<_>>(), vec!["cg01", "cg02"]);
    }
}
