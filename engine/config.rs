//! Pipeline configuration.
//!
//! A run is described by one TOML file. Relative paths in it are resolved against the
//! directory holding the file. Every configured artifact must exist before any sample is
//! processed; `validate` is the single place that checks this.

use crate::report::ReportSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file {path}: {source}")]
    TomlParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize the configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Configured {field} does not exist: {path}")]
    MissingArtifact { field: &'static str, path: String },
    #[error("Configured {field} must be a directory: {path}")]
    NotADirectory { field: &'static str, path: String },
    #[error("No clock models are configured for either the raw or the adjusted matrix.")]
    NoModels,
    #[error("Risk coefficient for {0} is not a finite number.")]
    InvalidRiskCoefficient(&'static str),
}

/// An external program invoked as `executable script args...`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub executable: String,
    pub script: PathBuf,
}

/// The external EpigenTL clock and the files it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpigenTlConfig {
    pub executable: String,
    pub script: PathBuf,
    /// Defaults to `EpigenTL_SourceFunctions.R` beside the script.
    #[serde(default)]
    pub source_functions: Option<PathBuf>,
    /// Headerless list of the model's probes.
    pub probe_panel_path: PathBuf,
    /// Saliva samples used to fill probes the batch lacks.
    pub saliva_reference_path: PathBuf,
}

impl EpigenTlConfig {
    pub fn source_functions_path(&self) -> PathBuf {
        match &self.source_functions {
            Some(path) => path.clone(),
            None => self
                .script
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("EpigenTL_SourceFunctions.R"),
        }
    }
}

fn default_raw_models() -> Vec<String> {
    vec!["Horvathv2".to_string()]
}

fn default_adjusted_models() -> Vec<String> {
    vec!["DunedinPACE".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// TOML correction bank.
    pub correction_model_path: PathBuf,
    /// One probe identifier per line.
    pub probe_panel_path: PathBuf,
    /// Directory of clock artifacts.
    pub clock_model_artifact_path: PathBuf,
    #[serde(default)]
    pub population_reference_path: Option<PathBuf>,
    #[serde(default)]
    pub mental_health_model_path: Option<PathBuf>,
    /// Root of the local object store for intermediate artifacts.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    #[serde(default)]
    pub signal_processor: Option<ProcessConfig>,
    #[serde(default)]
    pub deconvolution: Option<ProcessConfig>,
    /// Registers the `EpigenTL` clock; list it in `raw_models` or `adjusted_models` to run it.
    #[serde(default)]
    pub epigentl: Option<EpigenTlConfig>,
    #[serde(default = "default_raw_models")]
    pub raw_models: Vec<String>,
    #[serde(default = "default_adjusted_models")]
    pub adjusted_models: Vec<String>,
    #[serde(default)]
    pub report: ReportSettings,
}

impl PipelineConfig {
    /// Reads, resolves and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&toml_string).map_err(|source| ConfigError::TomlParse {
                path: path.display().to_string(),
                source,
            })?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let io_error = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = BufWriter::new(fs::File::create(path).map_err(io_error)?);
        file.write_all(toml_string.as_bytes()).map_err(io_error)?;
        file.flush().map_err(io_error)?;
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.correction_model_path);
        resolve(&mut self.probe_panel_path);
        resolve(&mut self.clock_model_artifact_path);
        for path in [
            &mut self.population_reference_path,
            &mut self.mental_health_model_path,
            &mut self.storage_root,
        ]
        .into_iter()
        .flatten()
        {
            resolve(path);
        }
        for process in [&mut self.signal_processor, &mut self.deconvolution]
            .into_iter()
            .flatten()
        {
            resolve(&mut process.script);
        }
        if let Some(epigentl) = &mut self.epigentl {
            resolve(&mut epigentl.script);
            resolve(&mut epigentl.probe_panel_path);
            resolve(&mut epigentl.saliva_reference_path);
            if let Some(path) = &mut epigentl.source_functions {
                resolve(path);
            }
        }
    }

    /// Checks that every configured artifact exists and that the run has work to do.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut files: Vec<(&'static str, &Path)> = vec![
            ("correction_model_path", self.correction_model_path.as_path()),
            ("probe_panel_path", self.probe_panel_path.as_path()),
        ];
        if let Some(path) = &self.population_reference_path {
            files.push(("population_reference_path", path.as_path()));
        }
        if let Some(path) = &self.mental_health_model_path {
            files.push(("mental_health_model_path", path.as_path()));
        }
        if let Some(process) = &self.signal_processor {
            files.push(("signal_processor.script", process.script.as_path()));
        }
        if let Some(process) = &self.deconvolution {
            files.push(("deconvolution.script", process.script.as_path()));
        }
        if let Some(epigentl) = &self.epigentl {
            files.push(("epigentl.script", epigentl.script.as_path()));
            files.push(("epigentl.probe_panel_path", epigentl.probe_panel_path.as_path()));
            files.push((
                "epigentl.saliva_reference_path",
                epigentl.saliva_reference_path.as_path(),
            ));
        }
        for (field, path) in files {
            if !path.exists() {
                return Err(ConfigError::MissingArtifact {
                    field,
                    path: path.display().to_string(),
                });
            }
        }
        if let Some(epigentl) = &self.epigentl {
            let source_functions = epigentl.source_functions_path();
            if !source_functions.exists() {
                return Err(ConfigError::MissingArtifact {
                    field: "epigentl.source_functions",
                    path: source_functions.display().to_string(),
                });
            }
        }

        let clocks = &self.clock_model_artifact_path;
        if !clocks.exists() {
            return Err(ConfigError::MissingArtifact {
                field: "clock_model_artifact_path",
                path: clocks.display().to_string(),
            });
        }
        if !clocks.is_dir() {
            return Err(ConfigError::NotADirectory {
                field: "clock_model_artifact_path",
                path: clocks.display().to_string(),
            });
        }

        if self.raw_models.is_empty() && self.adjusted_models.is_empty() {
            return Err(ConfigError::NoModels);
        }

        let risk = &self.report.risk;
        for (name, coefficient) in [
            ("all_cause_mortality", risk.all_cause_mortality),
            ("cardiovascular", risk.cardiovascular),
            ("diabetes", risk.diabetes),
            ("alzheimers", risk.alzheimers),
            ("cancer", risk.cancer),
        ] {
            if !coefficient.age.is_finite() || !coefficient.pace.is_finite() {
                return Err(ConfigError::InvalidRiskCoefficient(name));
            }
        }
        Ok(())
    }
}
