use std::fmt;

/// Stages reported while a batch moves through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    LoadMatrix,
    CellComposition,
    TissueAdjustment,
    RawClocks,
    AdjustedClocks,
    MentalHealth,
    ReportAssembly,
    ArtifactUpload,
}

impl PipelineStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::LoadMatrix => "methylation matrix loading",
            Self::CellComposition => "cell-type deconvolution",
            Self::TissueAdjustment => "tissue adjustment",
            Self::RawClocks => "clock ensemble on the raw matrix",
            Self::AdjustedClocks => "clock ensemble on the adjusted matrix",
            Self::MentalHealth => "mental-health classification",
            Self::ReportAssembly => "report assembly",
            Self::ArtifactUpload => "artifact upload",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress through the pipeline stages.
///
/// `total_steps` counts the units of work in a stage: models for the clock stages, samples
/// for report assembly, and one for single-shot stages.
pub trait StageObserver {
    fn on_stage_start(&mut self, stage: PipelineStage, total_steps: usize) {
        let _ = (stage, total_steps);
    }
    fn on_stage_advance(&mut self, stage: PipelineStage, completed_steps: usize) {
        let _ = (stage, completed_steps);
    }
    fn on_stage_finish(&mut self, stage: PipelineStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopStageObserver;

impl StageObserver for NoopStageObserver {}
