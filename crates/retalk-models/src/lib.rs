//! Shared data models for the retalk lip-sync pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Media assets and validated segment sequences
//! - Aligned (video, audio) segment pairs and synthesis results
//! - The pipeline run aggregate and its stage machine
//! - Progress events emitted while a run executes

pub mod asset;
pub mod progress;
pub mod run;

// Re-export common types
pub use asset::{MediaAsset, MediaKind, SegmentPair, SegmentSequence, SequenceError};
pub use progress::ProgressEvent;
pub use run::{
    FailureReason, PipelineRun, PipelineStage, RunId, StageTransitionError, SynthesisResult,
    SynthesisStatus,
};
