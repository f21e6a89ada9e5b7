//! Pipeline runs whose matrix and cell proportions come from external scripts.
#![cfg(unix)]

use epiclock::adjust::{CorrectionBank, CorrectionModel};
use epiclock::cells::CorrectionFeatures;
use epiclock::config::{EpigenTlConfig, PipelineConfig, ProcessConfig};
use epiclock::matrix::MatrixError;
use epiclock::progress::NoopStageObserver;
use epiclock::report::ReportSettings;
use epiclock::run::{Pipeline, PipelineError, PipelineResources, RunInputs};
use epiclock::shared::persist::{JsonReportStore, SampleRegistry};
use epiclock::shared::process::{
    ExternalDeconvolution, IdatMatrixSource, ProcessError, ScriptProcess,
};
use epiclock::shared::storage::{ArtifactKind, LocalObjectStore, ObjectStore};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SIGNAL_SCRIPT: &str = r#"
[ -f "$1" ] || { echo "missing sample sheet $1" >&2; exit 3; }
[ -d "$2" ] || { echo "missing idat dir $2" >&2; exit 4; }
echo "normalising 2 arrays"
echo '{"status": "success", "data": {"beta_table": [[0.40, 0.55], [0.50, null]], "rownames": ["cg01", "cg02"], "colnames": ["2049_R01C01", "2049_R02C01"]}}'
"#;

const DECONVOLUTION_SCRIPT: &str = r#"
head -n 1 "$1" | grep -q '^probeID,2049_R01C01,2049_R02C01' || { echo "bad handoff" >&2; exit 5; }
echo '{"status": "success", "data": {"cell_proportion": [{"SampleID": "2049_R01C01", "Epi": 0.5, "Fib": 0.1, "B": 0.05, "NK": 0.05, "CD4T": 0.1, "CD8T": 0.05, "Mono": 0.05, "Neutro": 0.1}, {"SampleID": "2049_R02C01", "Epi": 0.4, "Fib": 0.2, "B": 0.05, "NK": 0.1, "CD4T": 0.05, "CD8T": 0.05, "Mono": 0.05, "Neutro": 0.1}]}}'
"#;

const EPIGENTL_SCRIPT: &str = r#"
head -n 1 "$1" | grep -q '^probeID,2049_R01C01,2049_R02C01$' || { echo "bad handoff header" >&2; exit 5; }
grep -q '^cg05,0.5,0.5$' "$1" || { echo "saliva fill missing" >&2; exit 6; }
grep -q '^cg01,' "$1" && { echo "probe outside the panel" >&2; exit 7; }
[ -f "$2" ] || { echo "missing source functions $2" >&2; exit 8; }
echo "loading EpigenTL"
echo '{"status": "success", "data": {"epigentl_results": [{"SampleID": "2049_R02C01", "Age": 52.5}, {"SampleID": "2049_R01C01", "Age": 31.0}]}}'
"#;

const FAILING_SCRIPT: &str = r#"
echo "reading IDATs"
echo '{"status": "error", "message": "no IDAT pairs found"}'
"#;

fn write_resources(root: &Path) -> PipelineConfig {
    CorrectionBank::new(
        CorrectionFeatures::names(),
        vec![CorrectionModel {
            index: "cg01".into(),
            intercept: 0.02,
            coefficients: vec![0.0; 7],
        }],
    )
    .unwrap()
    .save(&root.join("bank.toml"))
    .unwrap();
    fs::write(root.join("panel.txt"), "cg01\n").unwrap();
    let clocks = root.join("clocks");
    fs::create_dir(&clocks).unwrap();
    fs::write(
        clocks.join("horvath.toml"),
        "name = \"Horvathv2\"\nintercept = 0.0\n\n[weights]\ncg01 = 100.0\n",
    )
    .unwrap();
    fs::write(
        clocks.join("pace.toml"),
        "name = \"DunedinPACE\"\nintercept = 0.6\n\n[weights]\ncg01 = 1.0\n",
    )
    .unwrap();
    fs::write(root.join("signal.sh"), SIGNAL_SCRIPT).unwrap();
    fs::write(root.join("deconvolve.sh"), DECONVOLUTION_SCRIPT).unwrap();
    fs::write(root.join("failing.sh"), FAILING_SCRIPT).unwrap();
    fs::write(root.join("epigentl.sh"), EPIGENTL_SCRIPT).unwrap();
    fs::write(root.join("EpigenTL_SourceFunctions.R"), "# sourced by the model\n").unwrap();
    fs::write(root.join("epigentl_probes.csv"), "cg02\ncg05\n").unwrap();
    fs::write(root.join("saliva.csv"), ",cg05,cg99\nsal1,0.25,0.9\nsal2,0.75,0.9\n").unwrap();
    fs::write(
        root.join("samplesheet.csv"),
        "Sample_Name,Sentrix_ID,Sentrix_Position\nalice,2049,R01C01\nbob,2049,R02C01\n",
    )
    .unwrap();
    fs::create_dir(root.join("idats")).unwrap();

    let config = PipelineConfig {
        correction_model_path: root.join("bank.toml"),
        probe_panel_path: root.join("panel.txt"),
        clock_model_artifact_path: clocks,
        population_reference_path: None,
        mental_health_model_path: None,
        storage_root: None,
        signal_processor: Some(ProcessConfig {
            executable: "sh".into(),
            script: root.join("signal.sh"),
        }),
        deconvolution: Some(ProcessConfig {
            executable: "sh".into(),
            script: root.join("deconvolve.sh"),
        }),
        epigentl: None,
        raw_models: vec!["Horvathv2".into()],
        adjusted_models: vec!["DunedinPACE".into()],
        report: ReportSettings::default(),
    };
    config.validate().unwrap();
    config
}

#[test]
fn scripted_signal_processing_and_deconvolution_feed_the_pipeline() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = write_resources(root);
    let resources = PipelineResources::load(&config).unwrap();

    let signal = ScriptProcess::new("sh", root.join("signal.sh"));
    let source = IdatMatrixSource {
        runner: &signal,
        idat_dir: root.join("idats"),
        sample_sheet: root.join("samplesheet.csv"),
    };
    let estimator = ExternalDeconvolution {
        runner: ScriptProcess::new("sh", root.join("deconvolve.sh")),
    };
    let registry =
        SampleRegistry::from_sample_sheet(&root.join("samplesheet.csv"), &root.join("idats"))
            .unwrap();
    let store = JsonReportStore::new(root.join("reports"), registry);

    let inputs = RunInputs {
        batch_name: "scripted",
        source: &source,
        estimator: &estimator,
        metadata: None,
        artifacts: None,
        reports: Some(&store),
    };
    let outcome = Pipeline::new(&config, &resources)
        .run(&inputs, &mut NoopStageObserver)
        .unwrap();

    assert_eq!(outcome.matrix.sample_ids(), &["2049_R01C01", "2049_R02C01"]);
    assert!(outcome.matrix.get("cg02", 1).unwrap().is_nan());
    assert_eq!(outcome.cells.sample_ids(), &["2049_R01C01", "2049_R02C01"]);
    assert_eq!(outcome.adjusted.matrix.probe_ids(), &["cg01"]);
    assert_eq!(outcome.reports.len(), 2);

    let batch = store.load_batch("scripted").unwrap();
    assert_eq!(batch.reports[0].sample.sample_name, "alice");
    assert_eq!(batch.reports[1].sample.sample_name, "bob");
}

#[test]
fn error_status_from_signal_processing_fails_the_batch() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let config = write_resources(root);
    let resources = PipelineResources::load(&config).unwrap();

    let failing = ScriptProcess::new("sh", root.join("failing.sh"));
    let source = IdatMatrixSource {
        runner: &failing,
        idat_dir: root.join("idats"),
        sample_sheet: root.join("samplesheet.csv"),
    };
    let estimator = ExternalDeconvolution {
        runner: ScriptProcess::new("sh", root.join("deconvolve.sh")),
    };
    let registry =
        SampleRegistry::from_sample_sheet(&root.join("samplesheet.csv"), &root.join("idats"))
            .unwrap();
    let store = JsonReportStore::new(root.join("reports"), registry);

    let inputs = RunInputs {
        batch_name: "failing",
        source: &source,
        estimator: &estimator,
        metadata: None,
        artifacts: None,
        reports: Some(&store),
    };
    let err = Pipeline::new(&config, &resources)
        .run(&inputs, &mut NoopStageObserver)
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Matrix(MatrixError::Process(ProcessError::Failed(ref message)))
            if message == "no IDAT pairs found"
    ));
    assert!(!root.join("reports").exists());
}

#[test]
fn scripted_epigentl_clock_runs_on_the_batch_and_stores_its_results() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let mut config = write_resources(root);
    config.epigentl = Some(EpigenTlConfig {
        executable: "sh".into(),
        script: root.join("epigentl.sh"),
        source_functions: None,
        probe_panel_path: root.join("epigentl_probes.csv"),
        saliva_reference_path: root.join("saliva.csv"),
    });
    config.raw_models.push("EpigenTL".into());
    config.validate().unwrap();
    let resources = PipelineResources::load(&config).unwrap();
    assert!(resources.gallery.get("EpigenTL").is_some());

    let signal = ScriptProcess::new("sh", root.join("signal.sh"));
    let source = IdatMatrixSource {
        runner: &signal,
        idat_dir: root.join("idats"),
        sample_sheet: root.join("samplesheet.csv"),
    };
    let estimator = ExternalDeconvolution {
        runner: ScriptProcess::new("sh", root.join("deconvolve.sh")),
    };
    let store = LocalObjectStore::new(root.join("store"));

    let inputs = RunInputs {
        batch_name: "scripted",
        source: &source,
        estimator: &estimator,
        metadata: None,
        artifacts: Some(&store),
        reports: None,
    };
    let outcome = Pipeline::new(&config, &resources)
        .run(&inputs, &mut NoopStageObserver)
        .unwrap();

    assert_eq!(
        outcome.raw_clocks.column("EpigenTL_Age"),
        Some(&[31.0, 52.5][..])
    );
    assert_eq!(
        outcome.reports[1].raw_predictions.get("EpigenTL_Age"),
        Some(&Some(52.5))
    );
    assert!(
        outcome
            .artifact_urls
            .iter()
            .any(|(kind, _)| *kind == ArtifactKind::EpigenTlResults)
    );
    let stored = store
        .download_as_text("epigentl_results/scripted_epigentl_results.csv")
        .unwrap();
    assert_eq!(
        stored,
        "SampleID,EpigenTL_Age\n2049_R01C01,31\n2049_R02C01,52.5\n"
    );
}

#[test]
fn failing_epigentl_script_is_a_partial_failure() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let mut config = write_resources(root);
    config.epigentl = Some(EpigenTlConfig {
        executable: "sh".into(),
        script: root.join("failing.sh"),
        source_functions: Some(root.join("EpigenTL_SourceFunctions.R")),
        probe_panel_path: root.join("epigentl_probes.csv"),
        saliva_reference_path: root.join("saliva.csv"),
    });
    config.raw_models.push("EpigenTL".into());
    let resources = PipelineResources::load(&config).unwrap();

    let signal = ScriptProcess::new("sh", root.join("signal.sh"));
    let source = IdatMatrixSource {
        runner: &signal,
        idat_dir: root.join("idats"),
        sample_sheet: root.join("samplesheet.csv"),
    };
    let estimator = ExternalDeconvolution {
        runner: ScriptProcess::new("sh", root.join("deconvolve.sh")),
    };
    let store = LocalObjectStore::new(root.join("store"));
    let inputs = RunInputs {
        batch_name: "partial",
        source: &source,
        estimator: &estimator,
        metadata: None,
        artifacts: Some(&store),
        reports: None,
    };
    let outcome = Pipeline::new(&config, &resources)
        .run(&inputs, &mut NoopStageObserver)
        .unwrap();

    assert_eq!(outcome.raw_clocks.columns(), &["Horvathv2_Predicted"]);
    assert!(
        store
            .list_objects("epigentl_results/")
            .unwrap()
            .is_empty()
    );
}
