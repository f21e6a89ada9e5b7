//! # Percentiles Against Population References
//!
//! Model outputs are ranked against population reference tables. Two kinds of ranking exist:
//!
//! - Empirical: `percentile` counts reference values strictly below the sample's value.
//!   Ties do not count. A missing reference never produces a number.
//! - Parametric: `pace_percentile` evaluates a Normal(1.0, 0.2) CDF, since pace of aging has
//!   no large empirical reference.
//!
//! Reference rows are filtered per sample by sex and by one of three age brackets. The
//! filter degrades step by step when metadata is missing and never fails for that reason.

use crate::metadata::Sex;
use polars::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Mean of the Normal approximation of the pace-of-aging distribution.
pub const PACE_MEAN: f64 = 1.0;
/// Standard deviation of the Normal approximation of the pace-of-aging distribution.
pub const PACE_SD: f64 = 0.2;

const AGE_COLUMN: &str = "age";
const SEX_COLUMN: &str = "sex";
const SEX_CODE_COLUMN: &str = "__sex_code";

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the population reference.")]
    ColumnNotFound(String),
}

// ========================================================================================
//                                   Ranking functions
// ========================================================================================

/// Empirical percentile of `value` within `population`.
///
/// Returns `None` when there is no population, when it holds no finite values, or when
/// `value` itself is not finite. Otherwise the result lies in `[0, 100]`.
pub fn percentile(value: f64, population: Option<&[f64]>) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    let population = population?;
    let (below, total) = population
        .iter()
        .filter(|reference| reference.is_finite())
        .fold((0usize, 0usize), |(below, total), &reference| {
            (below + usize::from(reference < value), total + 1)
        });
    if total == 0 {
        return None;
    }
    Some((100.0 * below as f64 / total as f64).clamp(0.0, 100.0))
}

/// Parametric pace-of-aging percentile from a Normal(1.0, 0.2) CDF.
pub fn pace_percentile(pace: f64) -> Option<f64> {
    if !pace.is_finite() {
        return None;
    }
    let normal = Normal::new(PACE_MEAN, PACE_SD).ok()?;
    Some((normal.cdf(pace) * 100.0).clamp(0.0, 100.0))
}

// ========================================================================================
//                                   Reference selection
// ========================================================================================

/// Age brackets used for reference filtering. Lower bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgeBracket {
    Under40,
    From40To59,
    From60,
}

impl AgeBracket {
    pub fn of(age: f64) -> Self {
        if age < 40.0 {
            Self::Under40
        } else if age < 60.0 {
            Self::From40To59
        } else {
            Self::From60
        }
    }

    fn filter(self) -> Expr {
        match self {
            Self::Under40 => col(AGE_COLUMN).lt(lit(40.0)),
            Self::From40To59 => col(AGE_COLUMN)
                .gt_eq(lit(40.0))
                .and(col(AGE_COLUMN).lt(lit(60.0))),
            Self::From60 => col(AGE_COLUMN).gt_eq(lit(60.0)),
        }
    }
}

impl fmt::Display for AgeBracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Under40 => "under 40",
            Self::From40To59 => "40-59",
            Self::From60 => "60+",
        })
    }
}

/// Which filters were applied to produce a selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionPrecision {
    SexAndAgeBracket,
    AgeBracketOnly,
    SexOnly,
    Unfiltered,
}

/// The reference rows that apply to one sample.
#[derive(Debug, Clone)]
pub struct ReferenceSelection {
    frame: DataFrame,
    precision: SelectionPrecision,
}

impl ReferenceSelection {
    pub fn new(frame: DataFrame, precision: SelectionPrecision) -> Self {
        Self { frame, precision }
    }

    pub fn precision(&self) -> SelectionPrecision {
        self.precision
    }

    pub fn n_rows(&self) -> usize {
        self.frame.height()
    }

    /// The finite values of a numeric column, or `None` when the column does not exist or
    /// cannot be read as numbers.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let column = self.frame.column(name).ok()?;
        let casted = column.cast(&DataType::Float64).ok()?;
        let values = casted
            .f64()
            .ok()?
            .into_iter()
            .flatten()
            .filter(|value| value.is_finite())
            .collect();
        Some(values)
    }
}

/// A capability that selects the reference rows applicable to a sample.
pub trait PopulationLookup {
    fn select(&self, age: Option<f64>, sex: Sex) -> Result<ReferenceSelection, ReferenceError>;
}

/// A population reference table with `age`, `sex` and numeric biomarker columns.
#[derive(Debug, Clone)]
pub struct PopulationReference {
    frame: DataFrame,
}

impl PopulationReference {
    /// Wraps an in-memory frame. `age` and `sex` columns are required.
    pub fn from_frame(mut frame: DataFrame) -> Result<Self, ReferenceError> {
        let names: Vec<String> = frame
            .get_column_names()
            .into_iter()
            .map(|name| name.as_str().to_string())
            .collect();
        for required in [AGE_COLUMN, SEX_COLUMN] {
            if !names.iter().any(|name| name == required) {
                return Err(ReferenceError::ColumnNotFound(required.to_string()));
            }
        }

        let ages = frame.column(AGE_COLUMN)?.cast(&DataType::Float64)?;
        let codes: Vec<i32> = frame
            .column(SEX_COLUMN)?
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|label| label.map(Sex::from_label).unwrap_or_default().code())
            .collect();
        frame.with_column(ages)?;
        frame.with_column(Series::new(SEX_CODE_COLUMN.into(), codes))?;
        Ok(Self { frame })
    }

    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let file = File::open(path)?;
        let frame = CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(file)
            .finish()?;
        log::info!(
            "Loaded population reference with {} rows and {} columns from {:?}",
            frame.height(),
            frame.width(),
            path
        );
        Self::from_frame(frame)
    }

    pub fn n_rows(&self) -> usize {
        self.frame.height()
    }

    fn filtered(&self, predicate: Expr) -> Result<DataFrame, ReferenceError> {
        Ok(self.frame.clone().lazy().filter(predicate).collect()?)
    }
}

impl PopulationLookup for PopulationReference {
    fn select(&self, age: Option<f64>, sex: Sex) -> Result<ReferenceSelection, ReferenceError> {
        let age = age.filter(|value| value.is_finite());
        let sex_filter = || col(SEX_CODE_COLUMN).eq(lit(sex.code()));

        let (frame, precision) = match (age.map(AgeBracket::of), sex.is_known()) {
            (Some(bracket), true) => (
                self.filtered(sex_filter().and(bracket.filter()))?,
                SelectionPrecision::SexAndAgeBracket,
            ),
            (Some(bracket), false) => {
                log::warn!(
                    "Sex unknown; using the {} age bracket of the population reference without a sex filter. Percentiles are less precise.",
                    bracket
                );
                (self.filtered(bracket.filter())?, SelectionPrecision::AgeBracketOnly)
            }
            (None, true) => (self.filtered(sex_filter())?, SelectionPrecision::SexOnly),
            (None, false) => (self.frame.clone(), SelectionPrecision::Unfiltered),
        };

        log::debug!(
            "Reference selection ({:?}) kept {} of {} rows",
            precision,
            frame.height(),
            self.frame.height()
        );
        Ok(ReferenceSelection::new(frame, precision))
    }
}
