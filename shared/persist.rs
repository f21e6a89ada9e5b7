//! # Report Persistence
//!
//! Finished reports leave the pipeline through a `ReportStore`. The JSON store writes one
//! file per batch and resolves every report to a registered sample first.
//!
//! - All or Nothing: an unresolved sample fails the batch before anything is written.
//! - Atomic Commit: the batch is written to a temporary file in the target directory and
//!   renamed into place, so readers never observe a partial batch.

use crate::report::Report;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to read the sample sheet: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to encode or decode a report batch: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Sample '{0}' appears more than once in the sample sheet.")]
    DuplicateSample(String),
    #[error(
        "Report for sample '{sample}' in batch '{batch}' does not match any registered sample. Nothing was saved."
    )]
    UnresolvedSample { batch: String, sample: String },
    #[error("Batch name '{0}' cannot be used as a file name.")]
    InvalidBatchName(String),
}

// ========================================================================================
//                                    Sample registry
// ========================================================================================

#[derive(Debug, Deserialize)]
struct SheetRow {
    #[serde(rename = "Sample_Name")]
    sample_name: String,
    #[serde(rename = "Sentrix_ID")]
    sentrix_id: String,
    #[serde(rename = "Sentrix_Position")]
    sentrix_position: String,
}

/// One sample-sheet row with the array identity and the IDAT pair it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_name: String,
    pub sentrix_id: String,
    pub sentrix_position: String,
    pub green_idat: PathBuf,
    pub red_idat: PathBuf,
}

impl SampleRecord {
    /// `{Sentrix_ID}_{Sentrix_Position}`, the column name the signal processor emits.
    pub fn array_id(&self) -> String {
        format!("{}_{}", self.sentrix_id, self.sentrix_position)
    }
}

/// The samples known to a batch, addressable by array identity or by sample name.
#[derive(Debug, Clone, Default)]
pub struct SampleRegistry {
    records: Vec<SampleRecord>,
    by_key: AHashMap<String, usize>,
}

impl SampleRegistry {
    pub fn new(records: Vec<SampleRecord>) -> Result<Self, PersistError> {
        let mut by_key = AHashMap::with_capacity(records.len() * 2);
        for (index, record) in records.iter().enumerate() {
            if by_key.insert(record.array_id(), index).is_some() {
                return Err(PersistError::DuplicateSample(record.array_id()));
            }
        }
        for (index, record) in records.iter().enumerate() {
            by_key.entry(record.sample_name.clone()).or_insert(index);
        }
        Ok(Self { records, by_key })
    }

    /// Reads an Illumina sample sheet. IDAT paths are `{idat_dir}/{array_id}_Grn.idat` and
    /// `{idat_dir}/{array_id}_Red.idat`.
    pub fn from_sample_sheet(sheet: &Path, idat_dir: &Path) -> Result<Self, PersistError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(sheet)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            let row: SheetRow = row?;
            let array_id = format!("{}_{}", row.sentrix_id, row.sentrix_position);
            records.push(SampleRecord {
                green_idat: idat_dir.join(format!("{}_Grn.idat", array_id)),
                red_idat: idat_dir.join(format!("{}_Red.idat", array_id)),
                sample_name: row.sample_name,
                sentrix_id: row.sentrix_id,
                sentrix_position: row.sentrix_position,
            });
        }
        log::info!("Registered {} samples from {:?}", records.len(), sheet);
        Self::new(records)
    }

    pub fn resolve(&self, sample: &str) -> Option<&SampleRecord> {
        self.by_key.get(sample).map(|&index| &self.records[index])
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ========================================================================================
//                                     Report stores
// ========================================================================================

/// What one committed batch amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSummary {
    pub batch_name: String,
    pub n_reports: usize,
    pub location: String,
}

/// A capability that commits a batch of reports.
pub trait ReportStore {
    fn save_batch(&self, batch_name: &str, reports: &[Report]) -> Result<SaveSummary, PersistError>;
}

/// A report bound to the registered sample it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub sample: SampleRecord,
    pub report: Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBatch {
    pub batch_name: String,
    pub saved_at: DateTime<Utc>,
    pub reports: Vec<StoredReport>,
}

/// Writes each batch to `{dir}/{batch_name}.json`.
#[derive(Debug, Clone)]
pub struct JsonReportStore {
    dir: PathBuf,
    registry: SampleRegistry,
}

impl JsonReportStore {
    pub fn new(dir: impl Into<PathBuf>, registry: SampleRegistry) -> Self {
        Self {
            dir: dir.into(),
            registry,
        }
    }

    fn batch_path(&self, batch_name: &str) -> Result<PathBuf, PersistError> {
        let valid = !batch_name.is_empty()
            && batch_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !batch_name.starts_with('.');
        if !valid {
            return Err(PersistError::InvalidBatchName(batch_name.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", batch_name)))
    }

    pub fn load_batch(&self, batch_name: &str) -> Result<StoredBatch, PersistError> {
        let file = File::open(self.batch_path(batch_name)?)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl ReportStore for JsonReportStore {
    fn save_batch(&self, batch_name: &str, reports: &[Report]) -> Result<SaveSummary, PersistError> {
        let target = self.batch_path(batch_name)?;

        let mut stored = Vec::with_capacity(reports.len());
        for report in reports {
            let Some(sample) = self.registry.resolve(&report.sample_name) else {
                log::error!(
                    "Rolling back batch {}: sample {} is not registered",
                    batch_name,
                    report.sample_name
                );
                return Err(PersistError::UnresolvedSample {
                    batch: batch_name.to_string(),
                    sample: report.sample_name.clone(),
                });
            };
            stored.push(StoredReport {
                sample: sample.clone(),
                report: report.clone(),
            });
        }
        let batch = StoredBatch {
            batch_name: batch_name.to_string(),
            saved_at: Utc::now(),
            reports: stored,
        };

        fs::create_dir_all(&self.dir)?;
        let staging = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(staging.as_file());
            serde_json::to_writer_pretty(&mut writer, &batch)?;
            writer.flush()?;
        }
        staging.as_file().sync_all()?;
        staging.persist(&target).map_err(|err| err.error)?;

        log::info!(
            "Committed {} reports for batch {} to {:?}",
            reports.len(),
            batch_name,
            target
        );
        Ok(SaveSummary {
            batch_name: batch_name.to_string(),
            n_reports: reports.len(),
            location: target.display().to_string(),
        })
    }
}
