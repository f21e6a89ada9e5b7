// ========================================================================================
//
//                      THE BATCH ORCHESTRATOR: EPICLOCK
//
// ========================================================================================
//
// The binary owns everything the library is handed explicitly: the configuration, the
// loaded resources, the object store, the external programs and the report store. It
// picks the collaborators from the command line, runs one batch, and prints a summary.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use epiclock::adjust::{CorrectionBank, adjust};
use epiclock::cells::{CellCompositionEstimator, CellProportionTable, PrecomputedCells};
use epiclock::config::{PipelineConfig, ProcessConfig};
use epiclock::matrix::{CsvMatrixSource, MatrixSource, ProbePanel, StoredMatrixSource};
use epiclock::metadata::SampleMetadata;
use epiclock::progress::{PipelineStage, StageObserver};
use epiclock::report::Report;
use epiclock::run::{Pipeline, PipelineResources, RunInputs};
use epiclock::shared::persist::{JsonReportStore, ReportStore, SampleRegistry};
use epiclock::shared::process::{ExternalDeconvolution, IdatMatrixSource, ScriptProcess};
use epiclock::shared::storage::{LocalObjectStore, ObjectStore};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "epiclock",
    version,
    about = "Biological-age reports from DNA methylation arrays."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one batch
    #[command(about = "Run the full pipeline for one batch (outputs: reports JSON)")]
    Run(RunArgs),

    /// Apply only the tissue adjustment to a beta table
    #[command(about = "Tissue-adjust a beta table (outputs: adjusted CSV)")]
    Adjust(AdjustArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Pipeline configuration (.toml)
    #[arg(long)]
    config: PathBuf,

    /// Name of the batch; used for artifact and report file names
    #[arg(long)]
    batch_name: String,

    /// Pre-processed beta table (.csv with a probeID column)
    #[arg(long, conflicts_with_all = ["stored_beta_table", "idat_dir"])]
    beta_table: Option<PathBuf>,

    /// Object key of a pre-processed beta table under the configured storage root
    #[arg(long, conflicts_with = "idat_dir")]
    stored_beta_table: Option<String>,

    /// Directory of raw IDAT files, processed by the configured signal processor
    #[arg(long, requires = "sample_sheet")]
    idat_dir: Option<PathBuf>,

    /// Illumina sample sheet (Sample_Name, Sentrix_ID, Sentrix_Position)
    #[arg(long)]
    sample_sheet: Option<PathBuf>,

    /// Pre-computed cell proportions (.csv with SampleID and cell-type columns)
    #[arg(long)]
    cell_proportions: Option<PathBuf>,

    /// Age and sex per sample, in matrix column order (.csv or .tsv)
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Directory that receives the committed report batch
    #[arg(long, requires = "sample_sheet")]
    reports_dir: Option<PathBuf>,

    /// Also write the assembled reports to this JSON file
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct AdjustArgs {
    /// Pre-processed beta table (.csv with a probeID column)
    beta_table: PathBuf,

    /// Cell proportions (.csv with SampleID and cell-type columns)
    #[arg(long)]
    cell_proportions: PathBuf,

    /// Correction bank (.toml)
    #[arg(long)]
    correction_model: PathBuf,

    /// Probe panel, one probe identifier per line
    #[arg(long)]
    probe_panel: PathBuf,

    /// Destination of the adjusted beta table
    #[arg(long)]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Run(args)) => run_batch(args),
        Some(Commands::Adjust(args)) => run_adjust(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                   PROGRESS DISPLAY
// ========================================================================================

/// Shows one spinner per stage on an interactive stderr.
struct SpinnerObserver {
    bar: Option<ProgressBar>,
}

impl SpinnerObserver {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl StageObserver for SpinnerObserver {
    fn on_stage_start(&mut self, stage: PipelineStage, total_steps: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_steps as u64), draw_target);
        if let Ok(style) =
            ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {pos}/{len} {msg}")
        {
            bar.set_style(style);
        }
        bar.set_message(stage.describe());
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    fn on_stage_advance(&mut self, _stage: PipelineStage, completed_steps: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed_steps as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: PipelineStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        log::debug!("Finished {}", stage);
    }
}

// ========================================================================================
//                                    SUBCOMMANDS
// ========================================================================================

fn run_batch(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let start_time = Instant::now();

    let config = PipelineConfig::load(&args.config)?;
    eprintln!("> Loaded configuration from {}", args.config.display());
    let resources = PipelineResources::load(&config)?;

    let object_store = config.storage_root.as_ref().map(LocalObjectStore::new);
    let artifacts = object_store.as_ref().map(|store| store as &dyn ObjectStore);

    // --- Matrix source ---
    let signal_runner = config.signal_processor.as_ref().map(script_process);
    let requested = (&args.beta_table, &args.stored_beta_table, &args.idat_dir);
    let source: Box<dyn MatrixSource + '_> = match requested {
        (Some(path), _, _) => Box::new(CsvMatrixSource::new(path)),
        (None, Some(key), _) => {
            let store = artifacts
                .ok_or("--stored-beta-table needs storage_root in the configuration")?;
            Box::new(StoredMatrixSource {
                store,
                path: key.clone(),
            })
        }
        (None, None, Some(idat_dir)) => {
            let runner = signal_runner
                .as_ref()
                .ok_or("--idat-dir needs a [signal_processor] section in the configuration")?;
            let sample_sheet = args
                .sample_sheet
                .clone()
                .ok_or("--idat-dir needs --sample-sheet")?;
            Box::new(IdatMatrixSource {
                runner,
                idat_dir: idat_dir.clone(),
                sample_sheet,
            })
        }
        (None, None, None) => {
            return Err("one of --beta-table, --stored-beta-table or --idat-dir is required".into());
        }
    };

    // --- Cell-composition estimator ---
    let estimator: Box<dyn CellCompositionEstimator> =
        match (&args.cell_proportions, &config.deconvolution) {
            (Some(path), _) => Box::new(PrecomputedCells {
                table: CellProportionTable::load(path)?,
            }),
            (None, Some(process)) => Box::new(ExternalDeconvolution {
                runner: script_process(process),
            }),
            (None, None) => {
                return Err("cell proportions are required: pass --cell-proportions or configure [deconvolution]".into());
            }
        };

    let metadata = args.metadata.as_deref().map(SampleMetadata::load).transpose()?;

    let report_store = match (&args.reports_dir, &args.sample_sheet) {
        (Some(dir), Some(sheet)) => {
            let idat_dir = args.idat_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let registry = SampleRegistry::from_sample_sheet(sheet, &idat_dir)?;
            Some(JsonReportStore::new(dir, registry))
        }
        _ => None,
    };

    eprintln!("> Running batch {} from {}", args.batch_name, source.describe());
    let inputs = RunInputs {
        batch_name: &args.batch_name,
        source: source.as_ref(),
        estimator: estimator.as_ref(),
        metadata: metadata.as_ref(),
        artifacts,
        reports: report_store.as_ref().map(|store| store as &dyn ReportStore),
    };
    let mut observer = SpinnerObserver::new();
    let outcome = Pipeline::new(&config, &resources).run(&inputs, &mut observer)?;

    for (kind, url) in &outcome.artifact_urls {
        eprintln!("> Stored {:?}: {}", kind, url);
    }
    if let Some(saved) = &outcome.saved {
        eprintln!(
            "> Committed {} reports for batch {} to {}",
            saved.n_reports, saved.batch_name, saved.location
        );
    }
    if let Some(path) = &args.output {
        write_reports(path, &outcome.reports)?;
        eprintln!("> Wrote reports to {}", path.display());
    }
    print_summary(&outcome.reports);

    eprintln!(
        "\nSuccess! Total execution time: {:.2?}",
        start_time.elapsed()
    );
    Ok(())
}

fn run_adjust(args: AdjustArgs) -> Result<(), Box<dyn std::error::Error>> {
    let matrix = CsvMatrixSource::new(&args.beta_table).load()?;
    let cells = CellProportionTable::load(&args.cell_proportions)?;
    let bank = CorrectionBank::load(&args.correction_model)?;
    let panel = ProbePanel::load(&args.probe_panel)?;

    let adjusted = adjust(&matrix, &cells, &bank, &panel)?;
    fs::write(&args.output, adjusted.matrix.to_csv_string()?)?;
    eprintln!(
        "> Wrote {} adjusted probes x {} samples to {}",
        adjusted.matrix.n_probes(),
        adjusted.matrix.n_samples(),
        args.output.display()
    );
    if !adjusted.non_finite_probes.is_empty() {
        eprintln!(
            "> Dropped {} probes with non-finite adjusted values",
            adjusted.non_finite_probes.len()
        );
    }
    Ok(())
}

// ========================================================================================
//                                  HELPER FUNCTIONS
// ========================================================================================

fn script_process(config: &ProcessConfig) -> ScriptProcess {
    ScriptProcess::new(&config.executable, &config.script)
}

fn write_reports(path: &Path, reports: &[Report]) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, reports)?;
    writer.flush()?;
    Ok(())
}

fn format_optional(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{:.*}", precision, v))
}

fn print_summary(reports: &[Report]) {
    println!("sample\tchrono_age\tbio_age\tdiff_age\tpace\tpace_percentile\tdirection");
    for report in reports {
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            report.sample_name,
            format_optional(report.chrono_age, 1),
            format_optional(report.bio_age, 2),
            format_optional(report.diff_age, 2),
            format_optional(report.pace, 3),
            format_optional(report.pace_percentile, 1),
            report
                .direction
                .map_or_else(|| "NA".to_string(), |direction| direction.to_string())
        );
    }
}
