//! Progress events emitted while a run executes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{PipelineStage, RunId};

/// Progress event for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The run entered a new stage
    StageChanged { run_id: RunId, stage: PipelineStage },

    /// Segmentation produced `count` aligned pairs
    SegmentsReady { run_id: RunId, count: u32 },

    /// Synthesis started for a pair
    SegmentStarted { run_id: RunId, index: u32, total: u32 },

    /// Synthesis finished for a pair
    SegmentCompleted { run_id: RunId, index: u32, total: u32 },

    /// The run produced its final output
    Completed { run_id: RunId, output_path: PathBuf },

    /// The run failed
    Failed {
        run_id: RunId,
        stage: PipelineStage,
        error: String,
    },
}

impl ProgressEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            ProgressEvent::StageChanged { run_id, .. }
            | ProgressEvent::SegmentsReady { run_id, .. }
            | ProgressEvent::SegmentStarted { run_id, .. }
            | ProgressEvent::SegmentCompleted { run_id, .. }
            | ProgressEvent::Completed { run_id, .. }
            | ProgressEvent::Failed { run_id, .. } => run_id,
        }
    }

    /// Synthesis progress in percent, for segment completion events.
    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressEvent::SegmentCompleted { index, total, .. } if *total > 0 => {
                let done = (*index as u64 + 1).min(*total as u64);
                Some((done * 100 / *total as u64) as u8)
            }
            ProgressEvent::Completed { .. } => Some(100),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. })
    }
}
