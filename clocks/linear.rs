//! Artifact-backed linear clocks.
//!
//! A linear clock is a penalised-regression predictor persisted as TOML: an intercept, one
//! weight per probe, optional reference betas used when a probe is missing, optional age
//! and sex terms, and an output transform. Most published clocks (Horvath, Hannum,
//! PhenoAge, DunedinPACE's final stage) fit this shape.

use super::{ClockError, ClockModel, ClockOutput};
use crate::matrix::MethylationMatrix;
use crate::metadata::{SampleMetadata, Sex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Adult age constant of the Horvath anti-log transform.
const HORVATH_ADULT_AGE: f64 = 20.0;

fn default_output() -> String {
    "Predicted".to_string()
}

fn default_max_missing_fraction() -> f64 {
    0.2
}

/// Post-processing applied to the linear predictor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTransform {
    #[default]
    Identity,
    /// Inverse of Horvath's log-linear age transform.
    HorvathAntiLog,
}

impl OutputTransform {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::HorvathAntiLog => {
                if x < 0.0 {
                    (1.0 + HORVATH_ADULT_AGE) * x.exp() - 1.0
                } else {
                    (1.0 + HORVATH_ADULT_AGE) * x + HORVATH_ADULT_AGE
                }
            }
        }
    }
}

/// Weights for chronological age and female sex.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovariateWeights {
    #[serde(default)]
    pub age: f64,
    #[serde(default)]
    pub female: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearClock {
    pub name: String,
    pub intercept: f64,
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub reference_betas: BTreeMap<String, f64>,
    #[serde(default)]
    pub transform: OutputTransform,
    #[serde(default = "default_output")]
    pub output: String,
    /// Largest tolerated share of weighted probes that are absent with no reference value.
    #[serde(default = "default_max_missing_fraction")]
    pub max_missing_fraction: f64,
    #[serde(default)]
    pub covariates: Option<CovariateWeights>,
}

impl LinearClock {
    pub fn load(path: &Path) -> Result<Self, ClockError> {
        let toml_string = fs::read_to_string(path)?;
        let clock: Self = toml::from_str(&toml_string).map_err(|source| ClockError::TomlParse {
            path: path.display().to_string(),
            source,
        })?;
        if !(0.0..=1.0).contains(&clock.max_missing_fraction) {
            return Err(ClockError::InvalidArtifact {
                model: clock.name,
                reason: "max_missing_fraction must lie in [0, 1]".to_string(),
            });
        }
        Ok(clock)
    }

    /// The value used for `probe` in sample `sample_idx`: the observed beta, else the
    /// reference beta, else the batch mean of the probe.
    fn imputed_beta(&self, probe: &str, row: &[f64], sample_idx: usize) -> Option<f64> {
        let observed = row[sample_idx];
        if observed.is_finite() {
            return Some(observed);
        }
        if let Some(&reference) = self.reference_betas.get(probe) {
            return Some(reference);
        }
        let (sum, count) = row
            .iter()
            .filter(|value| value.is_finite())
            .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
        (count > 0).then(|| sum / count as f64)
    }
}

impl ClockModel for LinearClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_metadata(&self) -> bool {
        self.covariates.is_some()
    }

    fn predict(
        &self,
        matrix: &MethylationMatrix,
        metadata: Option<&SampleMetadata>,
    ) -> Result<ClockOutput, ClockError> {
        let metadata = match (&self.covariates, metadata) {
            (Some(_), None) => return Err(ClockError::MissingMetadata(self.name.clone())),
            (_, metadata) => metadata,
        };

        let n_samples = matrix.n_samples();
        let mut linear = vec![self.intercept; n_samples];
        let mut unresolved = vec![false; n_samples];
        let mut missing = 0usize;

        for (probe, &weight) in &self.weights {
            match matrix.probe_values(probe) {
                Some(values) => {
                    let row = values.to_vec();
                    for (sample_idx, total) in linear.iter_mut().enumerate() {
                        match self.imputed_beta(probe, &row, sample_idx) {
                            Some(beta) => *total += weight * beta,
                            None => unresolved[sample_idx] = true,
                        }
                    }
                }
                None => match self.reference_betas.get(probe) {
                    Some(&reference) => linear.iter_mut().for_each(|total| *total += weight * reference),
                    None => missing += 1,
                },
            }
        }

        let total = self.weights.len();
        if total > 0 && missing as f64 / total as f64 > self.max_missing_fraction {
            return Err(ClockError::TooManyMissingProbes {
                model: self.name.clone(),
                missing,
                total,
            });
        }
        if missing > 0 {
            log::warn!(
                "Clock '{}' is missing {} of {} probes; they contribute nothing to the prediction.",
                self.name,
                missing,
                total
            );
        }

        if let (Some(covariates), Some(metadata)) = (&self.covariates, metadata) {
            for (sample_idx, total) in linear.iter_mut().enumerate() {
                let info = metadata.get(sample_idx);
                match info.and_then(|info| info.age) {
                    Some(age) => *total += covariates.age * age,
                    None if covariates.age != 0.0 => unresolved[sample_idx] = true,
                    None => {}
                }
                if info.map(|info| info.sex) == Some(Sex::Female) {
                    *total += covariates.female;
                }
            }
        }

        let values = linear
            .into_iter()
            .zip(unresolved)
            .map(|(x, unresolved)| {
                if unresolved {
                    f64::NAN
                } else {
                    self.transform.apply(x)
                }
            })
            .collect();
        Ok(ClockOutput::single(self.output.clone(), values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn matrix() -> MethylationMatrix {
        MethylationMatrix::new(
            vec!["cg01".into(), "cg02".into()],
            vec!["S1".into(), "S2".into()],
            array![[0.2, 0.6], [0.5, f64::NAN]],
        )
        .unwrap()
    }

    fn clock(weights: &[(&str, f64)]) -> LinearClock {
        LinearClock {
            name: "Test".into(),
            intercept: 0.1,
            weights: weights.iter().map(|(p, w)| (p.to_string(), *w)).collect(),
            reference_betas: BTreeMap::new(),
            transform: OutputTransform::Identity,
            output: default_output(),
            max_missing_fraction: 0.5,
            covariates: None,
        }
    }

    #[test]
    fn horvath_transform_is_continuous_at_zero() {
        let t = OutputTransform::HorvathAntiLog;
        assert_abs_diff_eq!(t.apply(0.0), 20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.apply(-1e-9), 20.0, epsilon = 1e-6);
        assert_abs_diff_eq!(t.apply(1.0), 41.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.apply(-1.0), 21.0 * (-1.0f64).exp() - 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_values_use_batch_mean_or_reference() {
        let mut clock = clock(&[("cg01", 1.0), ("cg02", 2.0)]);
        let output = clock.predict(&matrix(), None).unwrap();
        let (name, values) = &output.columns[0];
        assert_eq!(name, "Predicted");
        assert_abs_diff_eq!(values[0], 0.1 + 0.2 + 1.0, epsilon = 1e-12);
        // cg02 missing in S2: batch mean of cg02 is 0.5.
        assert_abs_diff_eq!(values[1], 0.1 + 0.6 + 1.0, epsilon = 1e-12);

        clock.reference_betas.insert("cg02".into(), 0.25);
        let output = clock.predict(&matrix(), None).unwrap();
        assert_abs_diff_eq!(output.columns[0].1[1], 0.1 + 0.6 + 0.5, epsilon = 1e-12);
    }

    #[test]
    fn too_many_absent_probes_fail_the_clock() {
        let clock = clock(&[("cg01", 1.0), ("cg98", 1.0), ("cg99", 1.0)]);
        let err = clock.predict(&matrix(), None).unwrap_err();
        assert!(matches!(
            err,
            ClockError::TooManyMissingProbes {
                missing: 2,
                total: 3,
                ..
            }
        ));
    }

    #[test]
    fn covariate_clock_requires_metadata() {
        let mut clock = clock(&[("cg01", 1.0)]);
        clock.covariates = Some(CovariateWeights {
            age: 0.01,
            female: 0.5,
        });
        assert!(clock.requires_metadata());
        assert!(matches!(
            clock.predict(&matrix(), None).unwrap_err(),
            ClockError::MissingMetadata(_)
        ));

        let metadata =
            SampleMetadata::new(vec![Some(50.0), None], vec![Sex::Female, Sex::Male]).unwrap();
        let output = clock.predict(&matrix(), Some(&metadata)).unwrap();
        let values = &output.columns[0].1;
        assert_abs_diff_eq!(values[0], 0.1 + 0.2 + 0.5 + 0.5, epsilon = 1e-12);
        assert!(values[1].is_nan());
    }
}
