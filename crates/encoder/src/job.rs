use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::classifier::SourceFile;
use crate::crop::CropGeometry;

/// Per-resolution stage, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    SubtitlesExtracted,
    AudioExtracted,
    CropDetected,
    QualityFound,
    FinalEncoding,
    FinalEncoded,
    Multiplexed,
    ScreenshotsExtracted,
    DocumentGenerated,
    Completed,
    Failed,
    Skipped,
}

impl Stage {
    /// Progress percentage reported on entering this stage.
    /// `None` for `Failed`/`Skipped`, which keep the last value.
    pub fn progress(&self) -> Option<u8> {
        match self {
            Stage::Pending => Some(0),
            Stage::SubtitlesExtracted => Some(10),
            Stage::AudioExtracted => Some(20),
            Stage::CropDetected => Some(30),
            Stage::QualityFound => Some(45),
            Stage::FinalEncoding => Some(50),
            Stage::FinalEncoded => Some(80),
            Stage::Multiplexed => Some(90),
            Stage::ScreenshotsExtracted => Some(95),
            Stage::DocumentGenerated => Some(98),
            Stage::Completed => Some(100),
            Stage::Failed | Stage::Skipped => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Skipped)
    }

    fn order(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Rejected stage change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid stage transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// One target resolution of a job and everything decided for it so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionTask {
    pub resolution: String,
    pub stage: Stage,
    pub progress: u8,
    pub crop: Option<CropGeometry>,
    pub quality: Option<u8>,
    pub measured_kbps: Option<u64>,
    /// Preview-search adjustments made
    pub search_iterations: u32,
    /// Full-file encodes run
    pub encode_attempts: u32,
    pub warnings: Vec<String>,
    pub reason: Option<String>,
}

impl ResolutionTask {
    pub fn new(resolution: impl Into<String>) -> Self {
        Self {
            resolution: resolution.into(),
            stage: Stage::Pending,
            progress: 0,
            crop: None,
            quality: None,
            measured_kbps: None,
            search_iterations: 0,
            encode_attempts: 0,
            warnings: Vec::new(),
            reason: None,
        }
    }

    /// Move forward to `next`. Stages only advance, terminal stages are
    /// final, and progress never decreases.
    pub fn advance(&mut self, next: Stage) -> Result<(), InvalidTransition> {
        let invalid = InvalidTransition { from: self.stage, to: next };
        if self.stage.is_terminal() {
            return Err(invalid);
        }
        if let Some(progress) = next.progress() {
            if next.order() <= self.stage.order() {
                return Err(invalid);
            }
            self.progress = self.progress.max(progress);
        }
        self.stage = next;
        Ok(())
    }

    /// Terminate as `Failed` or `Skipped` with a reason
    pub fn terminate(&mut self, stage: Stage, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        if !matches!(stage, Stage::Failed | Stage::Skipped) {
            return Err(InvalidTransition { from: self.stage, to: stage });
        }
        self.advance(stage)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn completed_with_warnings(&self) -> bool {
        self.stage == Stage::Completed && !self.warnings.is_empty()
    }
}

/// One source title and its per-resolution tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeJob {
    pub id: String,
    pub source: SourceFile,
    pub tasks: BTreeMap<String, ResolutionTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EncodeJob {
    /// One Pending task per resolution the source tier maps to
    pub fn new(source: SourceFile) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), source)
    }

    pub fn with_id(id: String, source: SourceFile) -> Self {
        let now = Utc::now();
        let tasks = source
            .resolutions
            .iter()
            .map(|r| (r.clone(), ResolutionTask::new(r.clone())))
            .collect();
        Self {
            id,
            source,
            tasks,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolutions in processing order (the tier map's order)
    pub fn resolution_order(&self) -> &[String] {
        &self.source.resolutions
    }

    pub fn source_filename(&self) -> String {
        self.source
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.path.display().to_string())
    }
}
