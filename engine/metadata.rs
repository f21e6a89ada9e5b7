//! Per-sample chronological age and sex, positionally aligned with matrix columns.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the metadata file.")]
    ColumnNotFound(String),
    #[error("Metadata lists have different lengths: {ages} ages but {sexes} sexes.")]
    LengthMismatch { ages: usize, sexes: usize },
    #[error("Metadata describes {found} samples but the matrix has {expected} sample columns.")]
    SampleCountMismatch { expected: usize, found: usize },
    #[error(
        "Metadata row {index} belongs to sample '{found}' but matrix column {index} is '{expected}'. Metadata must follow the matrix column order."
    )]
    OrderMismatch {
        index: usize,
        expected: String,
        found: String,
    },
}

/// Tri-state sex. Codes follow the clock gallery convention: 1 is female, 2 is male.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    #[default]
    Unknown,
}

impl Sex {
    /// Parses numeric codes and common labels. Anything unrecognised is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "1" | "1.0" | "f" | "female" => Sex::Female,
            "2" | "2.0" | "m" | "male" => Sex::Male,
            _ => Sex::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Sex::Female => 1,
            Sex::Male => 2,
            Sex::Unknown => 0,
        }
    }

    pub fn is_known(self) -> bool {
        self != Sex::Unknown
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sex::Female => "female",
            Sex::Male => "male",
            Sex::Unknown => "unknown",
        })
    }
}

/// The metadata of one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleInfo {
    pub age: Option<f64>,
    pub sex: Sex,
}

/// Age and sex lists for a batch. Entry `i` describes matrix column `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMetadata {
    ages: Vec<Option<f64>>,
    sexes: Vec<Sex>,
    sample_ids: Option<Vec<String>>,
}

impl SampleMetadata {
    pub fn new(ages: Vec<Option<f64>>, sexes: Vec<Sex>) -> Result<Self, MetadataError> {
        if ages.len() != sexes.len() {
            return Err(MetadataError::LengthMismatch {
                ages: ages.len(),
                sexes: sexes.len(),
            });
        }
        Ok(Self {
            ages,
            sexes,
            sample_ids: None,
        })
    }

    /// Attaches the sample identifiers the rows were recorded for, so alignment can be verified.
    pub fn with_sample_ids(mut self, sample_ids: Vec<String>) -> Result<Self, MetadataError> {
        if sample_ids.len() != self.len() {
            return Err(MetadataError::SampleCountMismatch {
                expected: self.len(),
                found: sample_ids.len(),
            });
        }
        self.sample_ids = Some(sample_ids);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<SampleInfo> {
        Some(SampleInfo {
            age: *self.ages.get(index)?,
            sex: *self.sexes.get(index)?,
        })
    }

    pub fn ages(&self) -> &[Option<f64>] {
        &self.ages
    }

    pub fn sexes(&self) -> &[Sex] {
        &self.sexes
    }

    /// Verifies the positional pairing with a matrix's sample columns. Rows are never reordered
    /// to fit; a mismatch is an error.
    pub fn check_alignment(&self, sample_ids: &[String]) -> Result<(), MetadataError> {
        if self.len() != sample_ids.len() {
            return Err(MetadataError::SampleCountMismatch {
                expected: sample_ids.len(),
                found: self.len(),
            });
        }
        if let Some(own) = &self.sample_ids {
            for (index, (expected, found)) in sample_ids.iter().zip(own).enumerate() {
                if expected != found {
                    return Err(MetadataError::OrderMismatch {
                        index,
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Loads `age` and `sex` columns, plus `sample_id` when present. `.tsv` files are
    /// tab-separated, everything else comma-separated.
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let separator = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
            _ => b',',
        };
        let file = File::open(path)?;
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .map_parse_options(|options| options.with_separator(separator))
            .into_reader_with_file_handle(file)
            .finish()?;

        let names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        for required in ["age", "sex"] {
            if !names.iter().any(|name| name == required) {
                return Err(MetadataError::ColumnNotFound(required.to_string()));
            }
        }

        let ages: Vec<Option<f64>> = df
            .column("age")?
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|age| age.filter(|value| value.is_finite()))
            .collect();
        let sexes: Vec<Sex> = df
            .column("sex")?
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|label| label.map(Sex::from_label).unwrap_or_default())
            .collect();

        let metadata = Self::new(ages, sexes)?;
        log::info!("Loaded metadata for {} samples from {:?}", metadata.len(), path);

        if names.iter().any(|name| name == "sample_id") {
            let ids: Vec<String> = df
                .column("sample_id")?
                .cast(&DataType::String)?
                .str()?
                .into_iter()
                .map(|id| id.unwrap_or_default().to_string())
                .collect();
            return metadata.with_sample_ids(ids);
        }
        Ok(metadata)
    }
}
