//! Depression-risk classification from clock biomarker outputs.
//!
//! The classifier was trained on blood. Saliva-derived biomarkers are first quantile-mapped
//! onto the blood training distribution: each batch value is located among the batch's own
//! percentiles (0 to 100) and replaced by the blood value at the same percentile, with
//! linear interpolation. A logistic model then gives a probability and a binary call.

use super::ClockError;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// One classifier input: its training name, the ensemble column it is read from, and its
/// logistic coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentalFeature {
    pub name: String,
    pub source_column: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MentalArtifact {
    intercept: f64,
    #[serde(default = "default_threshold")]
    threshold: f64,
    /// CSV with one column per feature `name`, resolved relative to the artifact file.
    blood_reference: PathBuf,
    features: Vec<MentalFeature>,
}

fn default_threshold() -> f64 {
    0.5
}

/// The classifier's result for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MentalHealthCall {
    pub probability: f64,
    pub positive: bool,
}

#[derive(Debug, Clone)]
pub struct MentalHealthModel {
    pub intercept: f64,
    pub threshold: f64,
    pub features: Vec<MentalFeature>,
    /// Percentiles 0..=100 of each feature's blood training values, in `features` order.
    blood_quantiles: Vec<Vec<f64>>,
}

impl MentalHealthModel {
    pub fn new(
        intercept: f64,
        threshold: f64,
        features: Vec<MentalFeature>,
        blood_values: &[Vec<f64>],
    ) -> Result<Self, ClockError> {
        let invalid = |reason: String| ClockError::InvalidArtifact {
            model: "mental_health".to_string(),
            reason,
        };
        if features.is_empty() {
            return Err(invalid("the classifier has no features".to_string()));
        }
        if let Some(feature) = features.iter().find(|f| !f.coefficient.is_finite()) {
            return Err(invalid(format!(
                "coefficient of '{}' is not finite",
                feature.name
            )));
        }
        if !intercept.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(format!(
                "intercept {} and threshold {} must be finite, with the threshold in [0, 1]",
                intercept, threshold
            )));
        }
        if blood_values.len() != features.len() {
            return Err(invalid(format!(
                "{} features but {} blood reference columns",
                features.len(),
                blood_values.len()
            )));
        }
        let mut blood_quantiles = Vec::with_capacity(features.len());
        for (feature, values) in features.iter().zip(blood_values) {
            let quantiles = percentiles(values).ok_or_else(|| {
                invalid(format!(
                    "blood reference for '{}' has no finite values",
                    feature.name
                ))
            })?;
            blood_quantiles.push(quantiles);
        }
        Ok(Self {
            intercept,
            threshold,
            features,
            blood_quantiles,
        })
    }

    /// Loads the TOML artifact and its blood reference table.
    pub fn load(path: &Path) -> Result<Self, ClockError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact: MentalArtifact =
            toml::from_str(&toml_string).map_err(|source| ClockError::TomlParse {
                path: path.display().to_string(),
                source,
            })?;

        let blood_path = match path.parent() {
            Some(dir) if artifact.blood_reference.is_relative() => dir.join(&artifact.blood_reference),
            _ => artifact.blood_reference.clone(),
        };
        let frame = CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(File::open(&blood_path)?)
            .finish()?;

        let mut blood_values = Vec::with_capacity(artifact.features.len());
        for feature in &artifact.features {
            let column = frame
                .column(&feature.name)
                .map_err(|_| ClockError::ColumnNotFound(feature.name.clone()))?
                .cast(&DataType::Float64)?;
            blood_values.push(column.f64()?.into_iter().flatten().collect::<Vec<f64>>());
        }

        log::info!(
            "Loaded mental-health classifier with {} features and {} blood reference rows",
            artifact.features.len(),
            frame.height()
        );
        Self::new(
            artifact.intercept,
            artifact.threshold,
            artifact.features,
            &blood_values,
        )
    }

    /// Ensemble columns the classifier reads.
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|feature| feature.source_column.as_str())
    }

    /// Classifies a batch. `columns` holds the source column values in `features` order,
    /// one value per sample. Samples with a non-finite input get no call.
    pub fn classify(&self, columns: &[Vec<f64>]) -> Vec<Option<MentalHealthCall>> {
        let n_samples = columns.first().map_or(0, Vec::len);
        let mapped: Vec<Vec<f64>> = columns
            .iter()
            .zip(&self.blood_quantiles)
            .map(|(batch, blood)| quantile_map(batch, blood))
            .collect();

        (0..n_samples)
            .map(|sample| {
                let mut linear = self.intercept;
                for (feature, values) in self.features.iter().zip(&mapped) {
                    let value = values[sample];
                    if !value.is_finite() {
                        return None;
                    }
                    linear += feature.coefficient * value;
                }
                let probability = 1.0 / (1.0 + (-linear).exp());
                Some(MentalHealthCall {
                    probability,
                    positive: probability >= self.threshold,
                })
            })
            .collect()
    }
}

/// Percentiles 0..=100 with linear interpolation between order statistics.
fn percentiles(values: &[f64]) -> Option<Vec<f64>> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let last = (sorted.len() - 1) as f64;
    Some(
        (0..=100)
            .map(|p| {
                let position = p as f64 / 100.0 * last;
                let lower = position.floor() as usize;
                let upper = position.ceil() as usize;
                let fraction = position - lower as f64;
                sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
            })
            .collect(),
    )
}

/// Piecewise-linear interpolation of `x` through `(xp, fp)`, clamped at both ends.
fn interpolate(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let upper = xp.partition_point(|&knot| knot <= x);
    let lower = upper - 1;
    let span = xp[upper] - xp[lower];
    if span <= 0.0 {
        return fp[lower];
    }
    fp[lower] + (fp[upper] - fp[lower]) * (x - xp[lower]) / span
}

fn quantile_map(batch: &[f64], blood_quantiles: &[f64]) -> Vec<f64> {
    let distinct = {
        let mut finite: Vec<f64> = batch.iter().copied().filter(|v| v.is_finite()).collect();
        finite.sort_by(f64::total_cmp);
        finite.dedup();
        finite.len()
    };
    let Some(batch_quantiles) = percentiles(batch) else {
        return vec![f64::NAN; batch.len()];
    };
    if distinct < 2 {
        // A constant batch has no spread to map; use the blood median.
        let median = blood_quantiles[50];
        return batch
            .iter()
            .map(|v| if v.is_finite() { median } else { f64::NAN })
            .collect();
    }
    batch
        .iter()
        .map(|&v| {
            if v.is_finite() {
                interpolate(v, &batch_quantiles, blood_quantiles)
            } else {
                f64::NAN
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    fn feature(name: &str, coefficient: f64) -> MentalFeature {
        MentalFeature {
            name: name.to_string(),
            source_column: format!("GrimAgeV2_DNAm{}_Pred", name),
            coefficient,
        }
    }

    #[test]
    fn percentiles_match_linear_interpolation() {
        let q = percentiles(&[4.0, 1.0, 3.0, 2.0, 5.0]).unwrap();
        assert_eq!(q.len(), 101);
        assert_abs_diff_eq!(q[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[50], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[100], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[10], 1.4, epsilon = 1e-12);
    }

    #[test]
    fn batch_extremes_map_to_blood_extremes() {
        let blood: Vec<f64> = (0..=100).map(|v| v as f64 * 10.0).collect();
        let model = MentalHealthModel::new(0.0, 0.5, vec![feature("ADM", 0.0)], &[blood]).unwrap();
        let mapped = quantile_map(&[1.0, 2.0, 3.0], &model.blood_quantiles[0]);
        assert_abs_diff_eq!(mapped[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mapped[1], 500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(mapped[2], 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn constant_batch_maps_to_blood_median() {
        let blood = vec![1.0, 2.0, 3.0, 10.0, 11.0];
        let quantiles = percentiles(&blood).unwrap();
        let mapped = quantile_map(&[7.0, 7.0, f64::NAN], &quantiles);
        assert_abs_diff_eq!(mapped[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mapped[1], 3.0, epsilon = 1e-12);
        assert!(mapped[2].is_nan());
    }

    #[test]
    fn logistic_call_uses_threshold() {
        let blood = vec![vec![-1.0, 0.0, 1.0]];
        let model = MentalHealthModel::new(0.0, 0.5, vec![feature("ADM", 2.0)], &blood).unwrap();
        let calls = model.classify(&[vec![10.0, 20.0, 30.0, f64::NAN]]);
        assert_eq!(calls.len(), 4);
        let low = calls[0].unwrap();
        let mid = calls[1].unwrap();
        let high = calls[2].unwrap();
        assert!(!low.positive && low.probability < 0.5);
        assert_abs_diff_eq!(mid.probability, 0.5, epsilon = 1e-9);
        assert!(mid.positive);
        assert!(high.positive && high.probability > 0.5);
        assert!(calls[3].is_none());
    }

    #[test]
    fn malformed_classifiers_are_rejected_at_construction() {
        let empty = MentalHealthModel::new(0.0, 0.5, Vec::new(), &[]).unwrap_err();
        assert!(matches!(
            empty,
            ClockError::InvalidArtifact { ref reason, .. } if reason.contains("no features")
        ));

        let unpaired = MentalHealthModel::new(
            0.0,
            0.5,
            vec![feature("ADM", 1.0), feature("TIMP1", 1.0)],
            &[vec![1.0, 2.0]],
        )
        .unwrap_err();
        assert!(matches!(unpaired, ClockError::InvalidArtifact { .. }));

        let nan_coefficient =
            MentalHealthModel::new(0.0, 0.5, vec![feature("ADM", f64::NAN)], &[vec![1.0, 2.0]])
                .unwrap_err();
        assert!(matches!(nan_coefficient, ClockError::InvalidArtifact { .. }));
    }

    #[test]
    fn artifact_without_features_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blood.csv"), "adm\n1.0\n").unwrap();
        fs::write(
            dir.path().join("mental.toml"),
            "intercept = 0.0\nblood_reference = \"blood.csv\"\nfeatures = []\n",
        )
        .unwrap();
        let err = MentalHealthModel::load(&dir.path().join("mental.toml")).unwrap_err();
        assert!(matches!(err, ClockError::InvalidArtifact { .. }));
    }

    #[test]
    fn artifact_loads_with_relative_blood_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut blood = File::create(dir.path().join("blood.csv")).unwrap();
        writeln!(blood, "adm,timp\n1.0,5.0\n2.0,6.0\n3.0,7.0").unwrap();
        fs::write(
            dir.path().join("mental.toml"),
            r#"intercept = -0.5
blood_reference = "blood.csv"

[[features]]
name = "adm"
source_column = "GrimAgeV2_DNAmADM_C_Pred"
coefficient = 0.3

[[features]]
name = "timp"
source_column = "GrimAgeV2_DNAmTIMP1_C_Pred"
coefficient = -0.1
"#,
        )
        .unwrap();

        let model = MentalHealthModel::load(&dir.path().join("mental.toml")).unwrap();
        assert_abs_diff_eq!(model.threshold, 0.5, epsilon = 1e-12);
        assert_eq!(
            model.source_columns().collect::<Vec<_>>(),
            vec!["GrimAgeV2_DNAmADM_C_Pred", "GrimAgeV2_DNAmTIMP1_C_Pred"]
        );
        assert_abs_diff_eq!(model.blood_quantiles[1][50], 6.0, epsilon = 1e-12);
    }
}
