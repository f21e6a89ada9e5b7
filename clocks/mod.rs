#![deny(dead_code)]
#![deny(unused_imports)]

//! Epigenetic clock models and the gallery that resolves them by name.
//!
//! A clock maps a methylation matrix (and, for some clocks, chronological age and sex) to
//! one or more named output columns with one value per sample. Missing predictions are
//! `NaN`.

pub mod epigentl;
pub mod linear;
pub mod mental;

pub use epigentl::{EPIGENTL_CLOCK, EpigenTlClock};
pub use linear::{LinearClock, OutputTransform};
pub use mental::{MentalHealthCall, MentalHealthModel};

use crate::matrix::{MatrixError, MethylationMatrix};
use crate::metadata::SampleMetadata;
use crate::shared::process::ProcessError;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse clock artifact {path}: {source}")]
    TomlParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
    #[error("Clock '{model}' is missing {missing} of its {total} probes, more than it tolerates.")]
    TooManyMissingProbes {
        model: String,
        missing: usize,
        total: usize,
    },
    #[error("Clock '{0}' needs age and sex metadata, but none was supplied.")]
    MissingMetadata(String),
    #[error("Clock '{0}' is defined more than once in the gallery.")]
    DuplicateClock(String),
    #[error("Clock artifact '{model}' is invalid: {reason}")]
    InvalidArtifact { model: String, reason: String },
    #[error("The required column '{0}' was not found in the blood reference table.")]
    ColumnNotFound(String),
    #[error("Clock input could not be prepared: {0}")]
    Matrix(#[from] MatrixError),
    #[error("External clock failed: {0}")]
    Process(#[from] ProcessError),
}

/// The named columns produced by one clock, each with one value per matrix sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockOutput {
    pub columns: Vec<(String, Vec<f64>)>,
}

impl ClockOutput {
    pub fn single(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            columns: vec![(name.into(), values)],
        }
    }
}

/// A named predictor over a methylation matrix.
pub trait ClockModel {
    fn name(&self) -> &str;

    /// Whether `predict` needs per-sample age and sex.
    fn requires_metadata(&self) -> bool {
        false
    }

    fn predict(
        &self,
        matrix: &MethylationMatrix,
        metadata: Option<&SampleMetadata>,
    ) -> Result<ClockOutput, ClockError>;
}

/// The clocks available to a pipeline run, resolved by name.
#[derive(Default)]
pub struct ClockGallery {
    models: Vec<Box<dyn ClockModel>>,
}

impl ClockGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: Box<dyn ClockModel>) -> Result<(), ClockError> {
        if self.get(model.name()).is_some() {
            return Err(ClockError::DuplicateClock(model.name().to_string()));
        }
        self.models.push(model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn ClockModel> {
        self.models
            .iter()
            .find(|model| model.name() == name)
            .map(|model| model.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|model| model.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Loads every `.toml` linear clock artifact in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, ClockError> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        paths.retain(|path| path.extension().and_then(|ext| ext.to_str()) == Some("toml"));
        paths.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));

        let mut gallery = Self::new();
        for path in paths {
            let clock = LinearClock::load(&path)?;
            log::info!(
                "Loaded clock '{}' ({} probes) from {:?}",
                clock.name,
                clock.weights.len(),
                path
            );
            gallery.insert(Box::new(clock))?;
        }
        Ok(gallery)
    }
}
