//! EpigenTL: a saliva-trained clock evaluated by an external R program.
//!
//! The batch is narrowed to the model's probe panel before the hand-off. Panel probes the
//! batch lacks are filled with the mean of the saliva reference samples; probes absent from
//! the reference are left out and the program handles them. The program receives the
//! hand-off CSV and its source-functions file, and answers with
//! `data.epigentl_results`: one record per sample, keyed by `SampleID`.

use super::{ClockError, ClockModel, ClockOutput};
use crate::cells::SAMPLE_ID_COLUMN;
use crate::matrix::{MethylationMatrix, ProbePanel};
use crate::metadata::SampleMetadata;
use crate::shared::process::{ProcessError, ProcessRunner, parse_contract};
use ahash::AHashMap;
use ndarray::{Array2, Axis};
use polars::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::Builder;

/// Gallery name of the clock and prefix of its ensemble columns.
pub const EPIGENTL_CLOCK: &str = "EpigenTL";

pub struct EpigenTlClock<R: ProcessRunner> {
    pub runner: R,
    pub probes: ProbePanel,
    /// Saliva reference mean per panel probe.
    pub saliva_means: BTreeMap<String, f64>,
    pub source_functions: PathBuf,
}

impl<R: ProcessRunner> EpigenTlClock<R> {
    /// Reads the probe panel and the saliva reference. The reference's first column is a
    /// sample index; every other column is one CpG.
    pub fn load(
        runner: R,
        probe_panel_path: &Path,
        saliva_reference_path: &Path,
        source_functions: PathBuf,
    ) -> Result<Self, ClockError> {
        let probes = ProbePanel::load(probe_panel_path)?;
        let frame = CsvReadOptions::default()
            .with_has_header(true)
            .into_reader_with_file_handle(File::open(saliva_reference_path)?)
            .finish()?;

        let mut saliva_means = BTreeMap::new();
        for column in frame.get_columns().iter().skip(1) {
            let name = column.name().as_str();
            if !probes.contains(name) {
                continue;
            }
            let values = column.cast(&DataType::Float64)?;
            if let Some(mean) = values.f64()?.mean().filter(|mean| mean.is_finite()) {
                saliva_means.insert(name.to_string(), mean);
            }
        }

        log::info!(
            "Loaded EpigenTL panel of {} probes; saliva reference covers {} of them",
            probes.len(),
            saliva_means.len()
        );
        Ok(Self {
            runner,
            probes,
            saliva_means,
            source_functions,
        })
    }

    /// The panel rows present in the batch, in batch order, followed by saliva-mean rows for
    /// the panel probes the batch lacks.
    pub fn prepare(&self, matrix: &MethylationMatrix) -> Result<MethylationMatrix, ClockError> {
        let observed = matrix.restrict_to(&self.probes);
        let mut probe_ids = observed.probe_ids().to_vec();
        let mut values = observed.values().to_owned();

        let mut unresolved = 0usize;
        for probe in self.probes.iter() {
            if matrix.contains_probe(probe) {
                continue;
            }
            match self.saliva_means.get(probe) {
                Some(&mean) => {
                    let row = Array2::from_elem((1, matrix.n_samples()), mean);
                    values
                        .append(Axis(0), row.view())
                        .map_err(|err| ClockError::InvalidArtifact {
                            model: EPIGENTL_CLOCK.to_string(),
                            reason: err.to_string(),
                        })?;
                    probe_ids.push(probe.to_string());
                }
                None => unresolved += 1,
            }
        }
        let imputed = probe_ids.len() - observed.n_probes();
        log::info!(
            "EpigenTL input: {} observed probes, {} filled from the saliva reference, {} unavailable",
            observed.n_probes(),
            imputed,
            unresolved
        );
        Ok(MethylationMatrix::new(
            probe_ids,
            matrix.sample_ids().to_vec(),
            values,
        )?)
    }
}

impl<R: ProcessRunner> ClockModel for EpigenTlClock<R> {
    fn name(&self) -> &str {
        EPIGENTL_CLOCK
    }

    fn predict(
        &self,
        matrix: &MethylationMatrix,
        _metadata: Option<&SampleMetadata>,
    ) -> Result<ClockOutput, ClockError> {
        let prepared = self.prepare(matrix)?;
        let mut handoff = Builder::new()
            .prefix("epiclock_epigentl_")
            .suffix(".csv")
            .tempfile()?;
        handoff.write_all(prepared.to_csv_string()?.as_bytes())?;
        handoff.flush()?;

        let args = vec![
            handoff.path().display().to_string(),
            self.source_functions.display().to_string(),
        ];
        let result = self.runner.invoke(&args)?;
        let data = parse_contract(&result)?;
        results_to_output(data, matrix.sample_ids())
    }
}

/// Aligns `epigentl_results` records to `sample_ids`. Every numeric field becomes one output
/// column; samples without a record get `NaN`.
fn results_to_output(data: Value, sample_ids: &[String]) -> Result<ClockOutput, ClockError> {
    let records: Vec<Map<String, Value>> = match data {
        Value::Object(mut object) => {
            let records = object
                .remove("epigentl_results")
                .ok_or_else(|| ProcessError::Payload("missing 'epigentl_results'".to_string()))?;
            serde_json::from_value(records)
                .map_err(|err| ProcessError::Payload(format!("EpigenTL results: {err}")))?
        }
        _ => return Err(ProcessError::Payload("payload is not an object".to_string()).into()),
    };

    let rows: AHashMap<&str, usize> = sample_ids
        .iter()
        .enumerate()
        .map(|(row, id)| (id.as_str(), row))
        .collect();
    let mut columns: Vec<(String, Vec<f64>)> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        let sample = record
            .get(SAMPLE_ID_COLUMN)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProcessError::Payload(format!("record {} has no {}", index, SAMPLE_ID_COLUMN))
            })?;
        let Some(&row) = rows.get(sample) else {
            log::warn!("EpigenTL returned a result for unknown sample {}", sample);
            continue;
        };
        for (field, value) in record {
            if field == SAMPLE_ID_COLUMN {
                continue;
            }
            let Some(value) = value.as_f64() else {
                continue;
            };
            let position = match columns.iter().position(|(name, _)| name == field) {
                Some(position) => position,
                None => {
                    columns.push((field.clone(), vec![f64::NAN; sample_ids.len()]));
                    columns.len() - 1
                }
            };
            columns[position].1[row] = value;
        }
    }

    let returned = records.len();
    if returned < sample_ids.len() {
        log::warn!(
            "EpigenTL returned {} results for {} samples",
            returned,
            sample_ids.len()
        );
    }
    Ok(ClockOutput { columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::process::ProcessResult;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::cell::RefCell;
    use std::fs;

    struct CannedRunner {
        stdout: String,
        seen_inputs: RefCell<Vec<String>>,
    }

    impl ProcessRunner for CannedRunner {
        fn describe(&self) -> String {
            "canned EpigenTL".to_string()
        }

        fn invoke(&self, args: &[String]) -> Result<ProcessResult, ProcessError> {
            self.seen_inputs
                .borrow_mut()
                .push(fs::read_to_string(&args[0]).unwrap());
            Ok(ProcessResult {
                stdout: self.stdout.clone(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn clock(stdout: &str) -> EpigenTlClock<CannedRunner> {
        EpigenTlClock {
            runner: CannedRunner {
                stdout: stdout.to_string(),
                seen_inputs: RefCell::new(Vec::new()),
            },
            probes: ProbePanel::new(["cg03", "cg01", "cg09", "cg10"]),
            saliva_means: BTreeMap::from([("cg09".to_string(), 0.3)]),
            source_functions: PathBuf::from("EpigenTL_SourceFunctions.R"),
        }
    }

    fn batch() -> MethylationMatrix {
        MethylationMatrix::new(
            vec!["cg01".into(), "cg02".into(), "cg03".into()],
            vec!["S1".into(), "S2".into()],
            array![[0.1, 0.2], [0.5, 0.5], [0.7, 0.8]],
        )
        .unwrap()
    }

    #[test]
    fn missing_panel_probes_take_the_saliva_mean() {
        let prepared = clock("").prepare(&batch()).unwrap();
        assert_eq!(prepared.probe_ids(), &["cg01", "cg03", "cg09"]);
        assert_abs_diff_eq!(prepared.get("cg09", 0).unwrap(), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.get("cg09", 1).unwrap(), 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(prepared.get("cg03", 1).unwrap(), 0.8, epsilon = 1e-12);
        assert!(!prepared.contains_probe("cg10"));
    }

    #[test]
    fn results_are_aligned_to_batch_order() {
        let clock = clock(
            r#"{"status":"success","data":{"epigentl_results":[{"SampleID":"S2","Age":41.5},{"SampleID":"S1","Age":30.0}]}}"#,
        );
        let output = clock.predict(&batch(), None).unwrap();
        assert_eq!(output.columns.len(), 1);
        assert_eq!(output.columns[0].0, "Age");
        assert_eq!(output.columns[0].1, vec![30.0, 41.5]);

        let handoff = &clock.runner.seen_inputs.borrow()[0];
        assert!(handoff.starts_with("probeID,S1,S2"));
        assert!(handoff.contains("cg09,0.3,0.3"));
        assert!(!handoff.contains("cg02"));
    }

    #[test]
    fn absent_sample_results_are_nan() {
        let clock = clock(
            r#"{"status":"success","data":{"epigentl_results":[{"SampleID":"S1","Age":30.0,"Note":"ok"}]}}"#,
        );
        let output = clock.predict(&batch(), None).unwrap();
        assert_eq!(output.columns.len(), 1);
        assert_eq!(output.columns[0].1[0], 30.0);
        assert!(output.columns[0].1[1].is_nan());
    }

    #[test]
    fn error_status_fails_the_prediction() {
        let clock = clock(r#"{"status":"error","message":"model file missing"}"#);
        let err = clock.predict(&batch(), None).unwrap_err();
        assert!(matches!(
            err,
            ClockError::Process(ProcessError::Failed(ref message)) if message == "model file missing"
        ));
    }

    #[test]
    fn saliva_reference_means_cover_panel_probes_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("probes.csv"), "cg01\ncg09\n").unwrap();
        fs::write(
            dir.path().join("saliva.csv"),
            ",cg01,cg09,cg77\nsal1,0.2,0.4,0.9\nsal2,0.4,0.6,0.9\n",
        )
        .unwrap();
        let clock = EpigenTlClock::load(
            CannedRunner {
                stdout: String::new(),
                seen_inputs: RefCell::new(Vec::new()),
            },
            &dir.path().join("probes.csv"),
            &dir.path().join("saliva.csv"),
            dir.path().join("EpigenTL_SourceFunctions.R"),
        )
        .unwrap();
        assert_eq!(clock.saliva_means.len(), 2);
        assert_abs_diff_eq!(clock.saliva_means["cg01"], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(clock.saliva_means["cg09"], 0.5, epsilon = 1e-12);
    }
}
