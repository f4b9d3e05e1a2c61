//! Pipeline error types.

use retalk_media::MediaError;
use retalk_models::{MediaKind, PipelineStage};
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Segmentation of {kind} failed: {message}")]
    SegmentationFailed {
        kind: MediaKind,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Segment count mismatch: {video} video segments vs {audio} audio segments")]
    SegmentCountMismatch { video: usize, audio: usize },

    #[error("Synthesis failed for segment {index}: {reason}")]
    SynthesisFailed { index: u32, reason: String },

    #[error("Reassembly failed: {message}")]
    ReassemblyFailed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Run cancelled while {stage}")]
    Cancelled { stage: PipelineStage },

    #[error("Workspace error: {0}")]
    Workspace(#[source] MediaError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error text plus the captured stderr tail, if any.
fn describe(err: &MediaError) -> String {
    match err.stderr() {
        Some(stderr) => format!("{}\n{}", err, stderr),
        None => err.to_string(),
    }
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify a failure raised while splitting `kind`.
    pub fn segmentation(kind: MediaKind, err: MediaError) -> Self {
        match err {
            MediaError::Cancelled => Self::Cancelled {
                stage: PipelineStage::Segmenting,
            },
            MediaError::Workspace { .. } => Self::Workspace(err),
            other => Self::SegmentationFailed {
                kind,
                exit_code: other.exit_code(),
                message: describe(&other),
            },
        }
    }

    /// Classify a failure raised while concatenating.
    pub fn reassembly(err: MediaError) -> Self {
        match err {
            MediaError::Cancelled => Self::Cancelled {
                stage: PipelineStage::Reassembling,
            },
            other => Self::ReassemblyFailed {
                exit_code: other.exit_code(),
                message: describe(&other),
            },
        }
    }

    pub fn synthesis(index: u32, reason: impl Into<String>) -> Self {
        Self::SynthesisFailed {
            index,
            reason: reason.into(),
        }
    }

    /// Stage in which the error arose, when it belongs to one.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineError::SegmentationFailed { .. } => Some(PipelineStage::Segmenting),
            PipelineError::SegmentCountMismatch { .. } => Some(PipelineStage::Dispatching),
            PipelineError::SynthesisFailed { .. } => Some(PipelineStage::Synthesizing),
            PipelineError::ReassemblyFailed { .. } => Some(PipelineStage::Reassembling),
            PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::Workspace(_) | PipelineError::Config(_) => None,
        }
    }

    /// Index of the segment whose synthesis failed.
    pub fn segment_index(&self) -> Option<u32> {
        match self {
            PipelineError::SynthesisFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
