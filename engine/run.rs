//! # Pipeline Orchestration
//!
//! Drives one batch through the stages in a fixed order: load the matrix, estimate cell
//! composition, adjust for tissue composition, run the clock ensembles, classify mental
//! health, and assemble reports.
//!
//! - Immutable Hand-off: every stage reads the outputs of earlier stages and produces a new
//!   value. The finished run is a `PipelineOutcome`; nothing is kept between batches.
//! - Fail Fast: any stage error ends the batch. Reports are only handed to a store after
//!   assembly succeeds, so a failed run persists nothing.

use crate::adjust::{AdjustError, AdjustedMatrix, CorrectionBank, adjust};
use crate::cells::{CellCompositionEstimator, CellError, CellProportionTable};
use crate::clocks::{
    ClockError, ClockGallery, EPIGENTL_CLOCK, EpigenTlClock, MentalHealthCall, MentalHealthModel,
};
use crate::config::{ConfigError, PipelineConfig};
use crate::ensemble::{EnsembleError, EnsembleTable, run_models};
use crate::matrix::{MatrixError, MatrixSource, MethylationMatrix, ProbePanel};
use crate::metadata::{MetadataError, SampleMetadata, Sex};
use crate::percentile::{PopulationLookup, PopulationReference, ReferenceError};
use crate::progress::{PipelineStage, StageObserver};
use crate::report::{Report, ReportError, ReportInputs, assemble};
use crate::shared::persist::{PersistError, ReportStore, SaveSummary};
use crate::shared::process::{ProcessError, ScriptProcess};
use crate::shared::storage::{ArtifactKind, ArtifactPath, ObjectStore, StorageError};
use chrono::Utc;
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Cells(#[from] CellError),
    #[error(transparent)]
    Adjust(#[from] AdjustError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Artifacts loaded once and shared read-only by every batch.
pub struct PipelineResources {
    pub bank: CorrectionBank,
    pub panel: ProbePanel,
    pub gallery: ClockGallery,
    pub reference: Option<PopulationReference>,
    pub mental_health: Option<MentalHealthModel>,
}

impl PipelineResources {
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let bank = CorrectionBank::load(&config.correction_model_path)?;
        let panel = ProbePanel::load(&config.probe_panel_path)?;
        let mut gallery = ClockGallery::load_dir(&config.clock_model_artifact_path)?;
        if let Some(epigentl) = &config.epigentl {
            let clock = EpigenTlClock::load(
                ScriptProcess::new(&epigentl.executable, &epigentl.script),
                &epigentl.probe_panel_path,
                &epigentl.saliva_reference_path,
                epigentl.source_functions_path(),
            )?;
            gallery.insert(Box::new(clock))?;
        }
        let reference = config
            .population_reference_path
            .as_deref()
            .map(PopulationReference::load)
            .transpose()?;
        let mental_health = config
            .mental_health_model_path
            .as_deref()
            .map(MentalHealthModel::load)
            .transpose()?;

        log::info!(
            "Loaded {} correction models, a {}-probe panel and {} clocks ({})",
            bank.len(),
            panel.len(),
            gallery.len(),
            gallery.names().iter().join(", ")
        );
        Ok(Self {
            bank,
            panel,
            gallery,
            reference,
            mental_health,
        })
    }
}

/// The per-batch collaborators of one run.
pub struct RunInputs<'a> {
    pub batch_name: &'a str,
    pub source: &'a dyn MatrixSource,
    pub estimator: &'a dyn CellCompositionEstimator,
    /// Age and sex in matrix column order.
    pub metadata: Option<&'a SampleMetadata>,
    /// Receives intermediate CSV artifacts when present.
    pub artifacts: Option<&'a dyn ObjectStore>,
    /// Receives the assembled reports when present.
    pub reports: Option<&'a dyn ReportStore>,
}

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub matrix: MethylationMatrix,
    pub cells: CellProportionTable,
    pub adjusted: AdjustedMatrix,
    pub raw_clocks: EnsembleTable,
    pub adjusted_clocks: EnsembleTable,
    pub mental_health: Option<Vec<Option<MentalHealthCall>>>,
    pub reports: Vec<Report>,
    pub artifact_urls: Vec<(ArtifactKind, String)>,
    pub saved: Option<SaveSummary>,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    resources: &'a PipelineResources,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, resources: &'a PipelineResources) -> Self {
        Self { config, resources }
    }

    pub fn run(
        &self,
        inputs: &RunInputs<'_>,
        observer: &mut dyn StageObserver,
    ) -> Result<PipelineOutcome, PipelineError> {
        let batch = inputs.batch_name;
        let mut artifact_urls = Vec::new();
        log::info!("Starting batch {} from {}", batch, inputs.source.describe());

        observer.on_stage_start(PipelineStage::LoadMatrix, 1);
        let matrix = inputs.source.load()?;
        matrix.ensure_beta_range()?;
        observer.on_stage_finish(PipelineStage::LoadMatrix);
        log::info!(
            "Loaded {} probes x {} samples",
            matrix.n_probes(),
            matrix.n_samples()
        );
        if let Some(metadata) = inputs.metadata {
            metadata.check_alignment(matrix.sample_ids())?;
        }
        upload(
            inputs,
            ArtifactKind::ProcessedBetaTable,
            || matrix.to_csv_string().map_err(PipelineError::from),
            &mut artifact_urls,
            observer,
        )?;

        observer.on_stage_start(PipelineStage::CellComposition, 1);
        let cells = inputs.estimator.estimate(&matrix)?;
        observer.on_stage_finish(PipelineStage::CellComposition);
        upload(
            inputs,
            ArtifactKind::CellProportions,
            || cells.to_csv_string().map_err(PipelineError::from),
            &mut artifact_urls,
            observer,
        )?;

        observer.on_stage_start(PipelineStage::TissueAdjustment, 1);
        let adjusted = adjust(
            &matrix,
            &cells,
            &self.resources.bank,
            &self.resources.panel,
        )?;
        observer.on_stage_finish(PipelineStage::TissueAdjustment);
        log::info!(
            "Adjusted matrix keeps {} probes ({} without a correction model, {} non-finite)",
            adjusted.matrix.n_probes(),
            adjusted.uncorrected_probes.len(),
            adjusted.non_finite_probes.len()
        );
        upload(
            inputs,
            ArtifactKind::AdjustedBetaTable,
            || adjusted.matrix.to_csv_string().map_err(PipelineError::from),
            &mut artifact_urls,
            observer,
        )?;

        let raw_clocks = run_models(
            &matrix,
            &self.config.raw_models,
            &self.resources.gallery,
            inputs.metadata,
            PipelineStage::RawClocks,
            observer,
        )?;
        upload(
            inputs,
            ArtifactKind::RawClockOutput,
            || raw_clocks.to_csv_string().map_err(PipelineError::from),
            &mut artifact_urls,
            observer,
        )?;

        let adjusted_clocks = run_models(
            &adjusted.matrix,
            &self.config.adjusted_models,
            &self.resources.gallery,
            inputs.metadata,
            PipelineStage::AdjustedClocks,
            observer,
        )?;
        upload(
            inputs,
            ArtifactKind::AdjustedClockOutput,
            || adjusted_clocks.to_csv_string().map_err(PipelineError::from),
            &mut artifact_urls,
            observer,
        )?;

        let epigentl = {
            let raw = raw_clocks.model_columns(EPIGENTL_CLOCK);
            if raw.is_empty() {
                adjusted_clocks.model_columns(EPIGENTL_CLOCK)
            } else {
                raw
            }
        };
        if !epigentl.is_empty() {
            upload(
                inputs,
                ArtifactKind::EpigenTlResults,
                || epigentl.to_csv_string().map_err(PipelineError::from),
                &mut artifact_urls,
                observer,
            )?;
        }

        let mental_health = match &self.resources.mental_health {
            Some(model) => {
                observer.on_stage_start(PipelineStage::MentalHealth, 1);
                let calls = classify_mental_health(model, &adjusted_clocks, &raw_clocks);
                observer.on_stage_finish(PipelineStage::MentalHealth);
                calls
            }
            None => None,
        };

        let unknown;
        let metadata = match inputs.metadata {
            Some(metadata) => metadata,
            None => {
                log::warn!(
                    "No sample metadata supplied for batch {}; ages and sexes are unknown.",
                    batch
                );
                let n = adjusted.matrix.n_samples();
                unknown = SampleMetadata::new(vec![None; n], vec![Sex::Unknown; n])?;
                &unknown
            }
        };
        observer.on_stage_start(PipelineStage::ReportAssembly, adjusted.matrix.n_samples());
        let report_inputs = ReportInputs {
            batch_name: batch,
            sample_ids: adjusted.matrix.sample_ids(),
            metadata,
            raw: &raw_clocks,
            adjusted: &adjusted_clocks,
            mental_health: mental_health.as_deref(),
            generated_at: Utc::now(),
        };
        let lookup = self
            .resources
            .reference
            .as_ref()
            .map(|reference| reference as &dyn PopulationLookup);
        let reports = assemble(&report_inputs, &self.config.report, lookup)?;
        observer.on_stage_finish(PipelineStage::ReportAssembly);

        let saved = match inputs.reports {
            Some(store) => Some(store.save_batch(batch, &reports)?),
            None => None,
        };

        Ok(PipelineOutcome {
            matrix,
            cells,
            adjusted,
            raw_clocks,
            adjusted_clocks,
            mental_health,
            reports,
            artifact_urls,
            saved,
        })
    }
}

fn upload<F>(
    inputs: &RunInputs<'_>,
    kind: ArtifactKind,
    render: F,
    urls: &mut Vec<(ArtifactKind, String)>,
    observer: &mut dyn StageObserver,
) -> Result<(), PipelineError>
where
    F: FnOnce() -> Result<String, PipelineError>,
{
    let Some(store) = inputs.artifacts else {
        return Ok(());
    };
    observer.on_stage_start(PipelineStage::ArtifactUpload, 1);
    let path = ArtifactPath::new(kind, inputs.batch_name).to_string();
    let url = store.upload_string(&render()?, &path)?;
    log::info!("Uploaded {}", url);
    urls.push((kind, url));
    observer.on_stage_finish(PipelineStage::ArtifactUpload);
    Ok(())
}

/// Reads the classifier's source columns from the adjusted table, falling back to the raw
/// table. A missing column skips classification for the whole batch.
fn classify_mental_health(
    model: &MentalHealthModel,
    adjusted: &EnsembleTable,
    raw: &EnsembleTable,
) -> Option<Vec<Option<MentalHealthCall>>> {
    let mut columns = Vec::with_capacity(model.features.len());
    for source in model.source_columns() {
        match adjusted.column(source).or_else(|| raw.column(source)) {
            Some(values) => columns.push(values.to_vec()),
            None => {
                log::warn!(
                    "Mental-health classifier skipped: ensemble column {} is missing.",
                    source
                );
                return None;
            }
        }
    }
    Some(model.classify(&columns))
}
