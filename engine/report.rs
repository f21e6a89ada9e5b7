//! # Report Assembly
//!
//! Binds the per-sample outputs of a pipeline run into immutable `Report` records.
//!
//! - Positional Alignment: report `i` belongs to matrix column `i`, and so does metadata row
//!   `i`. The lengths (and identifiers, when the metadata carries them) are checked before
//!   any report is built.
//! - Predictions are looked up by sample identifier in the raw and adjusted ensemble
//!   tables. A missing value stays missing; nothing downstream of it is fabricated.
//! - Risk deltas are fixed linear functions of the age difference and of the pace excess
//!   over 1.0. They are only derived for samples with a pace value.
//!
//! The assembler never persists anything. It returns the batch to the caller.

use crate::clocks::MentalHealthCall;
use crate::ensemble::EnsembleTable;
use crate::metadata::{MetadataError, SampleMetadata, Sex};
use crate::percentile::{PopulationLookup, ReferenceError, pace_percentile, percentile};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Age differences within this many years count as on track.
const ON_TRACK_YEARS: f64 = 1.0;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Metadata does not line up with the matrix: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Population reference lookup failed: {0}")]
    Reference(#[from] ReferenceError),
    #[error("Mental-health calls cover {found} samples but the batch has {expected}.")]
    MentalHealthLength { expected: usize, found: usize },
}

// ========================================================================================
//                                 Direction and risk types
// ========================================================================================

/// Whether biological age runs ahead of or behind chronological age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingDirection {
    Older,
    Younger,
    OnTrack,
}

impl AgingDirection {
    pub fn from_difference(diff_age: f64) -> Self {
        if diff_age > ON_TRACK_YEARS {
            Self::Older
        } else if diff_age < -ON_TRACK_YEARS {
            Self::Younger
        } else {
            Self::OnTrack
        }
    }

    /// A one-sentence reader-facing summary of the difference.
    pub fn comment(self, diff_age: f64) -> String {
        match self {
            Self::Older => format!(
                "Biological age is {:.1} years above chronological age.",
                diff_age
            ),
            Self::Younger => format!(
                "Biological age is {:.1} years below chronological age.",
                -diff_age
            ),
            Self::OnTrack => "Biological age is in line with chronological age.".to_string(),
        }
    }
}

impl fmt::Display for AgingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Older => "older",
            Self::Younger => "younger",
            Self::OnTrack => "on track",
        })
    }
}

/// Health outcomes with risk deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    AllCauseMortality,
    Cardiovascular,
    Diabetes,
    Alzheimers,
    Cancer,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::AllCauseMortality,
        Outcome::Cardiovascular,
        Outcome::Diabetes,
        Outcome::Alzheimers,
        Outcome::Cancer,
    ];

    /// Short key used in flat exports.
    pub fn key(self) -> &'static str {
        match self {
            Self::AllCauseMortality => "acm",
            Self::Cardiovascular => "cvd",
            Self::Diabetes => "dm",
            Self::Alzheimers => "ad",
            Self::Cancer => "cancer",
        }
    }
}

/// Percent change in risk per year of age difference and per unit of pace above 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskCoefficient {
    pub age: f64,
    pub pace: f64,
}

/// The fixed per-outcome risk coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskCoefficients {
    pub all_cause_mortality: RiskCoefficient,
    pub cardiovascular: RiskCoefficient,
    pub diabetes: RiskCoefficient,
    pub alzheimers: RiskCoefficient,
    pub cancer: RiskCoefficient,
}

impl Default for RiskCoefficients {
    fn default() -> Self {
        Self {
            all_cause_mortality: RiskCoefficient {
                age: 4.0,
                pace: 400.0,
            },
            cardiovascular: RiskCoefficient {
                age: 3.0,
                pace: 300.0,
            },
            diabetes: RiskCoefficient {
                age: 2.5,
                pace: 350.0,
            },
            alzheimers: RiskCoefficient {
                age: 2.0,
                pace: 200.0,
            },
            cancer: RiskCoefficient {
                age: 1.5,
                pace: 150.0,
            },
        }
    }
}

impl RiskCoefficients {
    pub fn get(&self, outcome: Outcome) -> RiskCoefficient {
        match outcome {
            Outcome::AllCauseMortality => self.all_cause_mortality,
            Outcome::Cardiovascular => self.cardiovascular,
            Outcome::Diabetes => self.diabetes,
            Outcome::Alzheimers => self.alzheimers,
            Outcome::Cancer => self.cancer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRisk {
    pub outcome: Outcome,
    /// Risk delta from the age difference; absent without a chronological age.
    pub age_risk: Option<f64>,
    /// Absent when the delta is not a finite number.
    pub pace_risk: Option<f64>,
}

/// Risk deltas for every outcome. Empty without a pace value.
pub fn risk_profile(
    coefficients: &RiskCoefficients,
    diff_age: Option<f64>,
    pace: Option<f64>,
) -> Vec<OutcomeRisk> {
    let Some(pace) = pace else {
        return Vec::new();
    };
    Outcome::ALL
        .iter()
        .map(|&outcome| {
            let coefficient = coefficients.get(outcome);
            OutcomeRisk {
                outcome,
                age_risk: finite(diff_age.map(|diff| coefficient.age * diff)),
                pace_risk: finite(Some(coefficient.pace * (pace - 1.0))),
            }
        })
        .collect()
}

// ========================================================================================
//                                      Settings
// ========================================================================================

/// Which ensemble table a prediction column is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Raw,
    Adjusted,
}

/// A prediction ranked against a reference column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileColumn {
    /// Key in `Report::reference_percentiles`.
    pub name: String,
    pub source: PredictionSource,
    pub prediction: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Raw-ensemble column holding the biological age.
    pub bio_age_column: String,
    /// Adjusted-ensemble column holding the pace of aging.
    pub pace_column: String,
    pub percentile_columns: Vec<PercentileColumn>,
    pub risk: RiskCoefficients,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            bio_age_column: "Horvathv2_Predicted".to_string(),
            pace_column: "DunedinPACE_Predicted".to_string(),
            percentile_columns: vec![
                PercentileColumn {
                    name: "bio_age".to_string(),
                    source: PredictionSource::Raw,
                    prediction: "Horvathv2_Predicted".to_string(),
                    reference: "bio_age".to_string(),
                },
                PercentileColumn {
                    name: "pace".to_string(),
                    source: PredictionSource::Adjusted,
                    prediction: "DunedinPACE_Predicted".to_string(),
                    reference: "pace".to_string(),
                },
            ],
            risk: RiskCoefficients::default(),
        }
    }
}

// ========================================================================================
//                                       Reports
// ========================================================================================

/// The per-sample output of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub sample_name: String,
    pub batch_name: String,
    pub chrono_age: Option<f64>,
    pub sex: Sex,
    pub bio_age: Option<f64>,
    pub pace: Option<f64>,
    pub diff_age: Option<f64>,
    pub direction: Option<AgingDirection>,
    pub direction_comment: Option<String>,
    pub pace_percentile: Option<f64>,
    pub reference_percentiles: BTreeMap<String, Option<f64>>,
    pub risks: Vec<OutcomeRisk>,
    pub raw_predictions: BTreeMap<String, Option<f64>>,
    pub adjusted_predictions: BTreeMap<String, Option<f64>>,
    pub mental_health: Option<MentalHealthCall>,
    pub report_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
}

/// Everything a batch of reports is built from.
pub struct ReportInputs<'a> {
    pub batch_name: &'a str,
    /// Sample columns of the post-adjustment matrix, in order.
    pub sample_ids: &'a [String],
    pub metadata: &'a SampleMetadata,
    pub raw: &'a EnsembleTable,
    pub adjusted: &'a EnsembleTable,
    /// Per-sample calls in `sample_ids` order.
    pub mental_health: Option<&'a [Option<MentalHealthCall>]>,
    pub generated_at: DateTime<Utc>,
}

/// Report numbers are finite or absent, so a serialised `null` always means "not available".
fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|value| value.is_finite())
}

fn predictions(table: &EnsembleTable, sample: &str) -> BTreeMap<String, Option<f64>> {
    table.sample_values(sample).into_iter().collect()
}

/// Builds one report per sample column, in column order.
pub fn assemble(
    inputs: &ReportInputs<'_>,
    settings: &ReportSettings,
    lookup: Option<&dyn PopulationLookup>,
) -> Result<Vec<Report>, ReportError> {
    inputs.metadata.check_alignment(inputs.sample_ids)?;
    if let Some(calls) = inputs.mental_health {
        if calls.len() != inputs.sample_ids.len() {
            return Err(ReportError::MentalHealthLength {
                expected: inputs.sample_ids.len(),
                found: calls.len(),
            });
        }
    }
    if lookup.is_none() {
        log::warn!("No population reference is available; reference percentiles will be empty.");
    }

    let mut reports = Vec::with_capacity(inputs.sample_ids.len());
    for (index, sample) in inputs.sample_ids.iter().enumerate() {
        let info = inputs.metadata.get(index).unwrap_or_default();

        let chrono_age = finite(info.age);
        let bio_age = finite(inputs.raw.get(sample, &settings.bio_age_column));
        let pace = finite(inputs.adjusted.get(sample, &settings.pace_column));
        let diff_age = finite(bio_age.zip(chrono_age).map(|(bio, chrono)| bio - chrono));
        let direction = diff_age.map(AgingDirection::from_difference);

        let selection = match lookup {
            Some(lookup) => Some(lookup.select(chrono_age, info.sex)?),
            None => None,
        };
        let reference_percentiles = settings
            .percentile_columns
            .iter()
            .map(|column| {
                let table = match column.source {
                    PredictionSource::Raw => inputs.raw,
                    PredictionSource::Adjusted => inputs.adjusted,
                };
                let population = selection
                    .as_ref()
                    .and_then(|selection| selection.column(&column.reference));
                let value = finite(
                    table
                        .get(sample, &column.prediction)
                        .and_then(|value| percentile(value, population.as_deref())),
                );
                (column.name.clone(), value)
            })
            .collect();

        reports.push(Report {
            sample_name: sample.clone(),
            batch_name: inputs.batch_name.to_string(),
            chrono_age,
            sex: info.sex,
            bio_age,
            pace,
            diff_age,
            direction,
            direction_comment: direction.zip(diff_age).map(|(d, diff)| d.comment(diff)),
            pace_percentile: finite(pace.and_then(pace_percentile)),
            reference_percentiles,
            risks: risk_profile(&settings.risk, diff_age, pace),
            raw_predictions: predictions(inputs.raw, sample),
            adjusted_predictions: predictions(inputs.adjusted, sample),
            mental_health: inputs
                .mental_health
                .and_then(|calls| calls.get(index).copied().flatten())
                .filter(|call| call.probability.is_finite()),
            report_date: inputs.generated_at.date_naive(),
            generated_at: inputs.generated_at,
        });
    }

    log::info!(
        "Assembled {} reports for batch {}",
        reports.len(),
        inputs.batch_name
    );
    Ok(reports)
}
