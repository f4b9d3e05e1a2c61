//! Pipeline run aggregate and its stage machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::{MediaAsset, SegmentSequence};

/// Unique identifier for a pipeline run; also names its workspace namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used where a full UUID is too noisy.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage of a pipeline run.
///
/// `Start → Segmenting → Dispatching → Synthesizing → Reassembling →
/// CleaningUp → Done`. `Failed` is reachable from any non-terminal stage.
/// A failed run still passes through `CleaningUp` before settling in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Start,
    Segmenting,
    Dispatching,
    Synthesizing,
    Reassembling,
    CleaningUp,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Start => "start",
            PipelineStage::Segmenting => "segmenting",
            PipelineStage::Dispatching => "dispatching",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Reassembling => "reassembling",
            PipelineStage::CleaningUp => "cleaning_up",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }

    /// Whether `next` is a legal successor of this stage.
    pub fn can_transition_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Start, Segmenting)
            | (Segmenting, Dispatching)
            | (Dispatching, Synthesizing)
            | (Synthesizing, Reassembling)
            | (Reassembling, CleaningUp)
            | (CleaningUp, Done) => true,
            // Cleanup runs after a failure in any working stage.
            (Segmenting | Dispatching | Synthesizing | Reassembling, CleaningUp) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal stage transition {from} -> {to}")]
pub struct StageTransitionError {
    pub from: PipelineStage,
    pub to: PipelineStage,
}

/// Why a synthesis invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The tool ran and exited non-zero (code absent when killed by a signal)
    ExitStatus { code: Option<i32> },
    /// The deadline expired and the process was killed
    TimedOut { after_secs: u64 },
    /// The run was cancelled while the process was running
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExitStatus { code: Some(code) } => write!(f, "exited with status {code}"),
            FailureReason::ExitStatus { code: None } => write!(f, "terminated by signal"),
            FailureReason::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one synthesis invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SynthesisStatus {
    Succeeded,
    Failed(FailureReason),
}

/// Result of synthesizing one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisResult {
    pub index: u32,
    pub output_path: PathBuf,
    pub status: SynthesisStatus,
}

impl SynthesisResult {
    pub fn succeeded(index: u32, output_path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            output_path: output_path.into(),
            status: SynthesisStatus::Succeeded,
        }
    }

    pub fn failed(index: u32, output_path: impl Into<PathBuf>, reason: FailureReason) -> Self {
        Self {
            index,
            output_path: output_path.into(),
            status: SynthesisStatus::Failed(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, SynthesisStatus::Succeeded)
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.status {
            SynthesisStatus::Failed(reason) => Some(reason),
            SynthesisStatus::Succeeded => None,
        }
    }
}

/// One user-triggered conversion from request to final output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub id: RunId,

    /// Segment duration in seconds; 0 disables segmentation
    pub segment_seconds: f64,

    pub input_video: MediaAsset,
    pub input_audio: MediaAsset,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_segments: Option<SegmentSequence>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_segments: Option<SegmentSequence>,

    /// Synthesis results, strictly in index order
    #[serde(default)]
    pub results: Vec<SynthesisResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub stage: PipelineStage,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(segment_seconds: f64, input_video: MediaAsset, input_audio: MediaAsset) -> Self {
        Self::with_id(RunId::new(), segment_seconds, input_video, input_audio)
    }

    pub fn with_id(
        id: RunId,
        segment_seconds: f64,
        input_video: MediaAsset,
        input_audio: MediaAsset,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            segment_seconds,
            input_video,
            input_audio,
            video_segments: None,
            audio_segments: None,
            results: Vec::new(),
            output_path: None,
            stage: PipelineStage::Start,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the run splits its inputs.
    pub fn is_segmented(&self) -> bool {
        self.segment_seconds > 0.0
    }

    /// Move to `next`, enforcing the stage table.
    pub fn advance(&mut self, next: PipelineStage) -> Result<(), StageTransitionError> {
        if !self.stage.can_transition_to(next) {
            return Err(StageTransitionError {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a result; it must carry the next expected index.
    pub fn record_result(&mut self, result: SynthesisResult) -> Result<(), SynthesisResult> {
        if result.index as usize != self.results.len() {
            return Err(result);
        }
        self.results.push(result);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, output_path: impl Into<PathBuf>) {
        self.output_path = Some(output_path.into());
        self.updated_at = Utc::now();
    }
}
