#![deny(unreachable_patterns)]
//! External tool plumbing for the retalk pipeline.
//!
//! This crate provides:
//! - Type-safe command building for FFmpeg and the synthesis tool
//! - A process runner that streams output line by line, with deadlines
//!   and cancellation support via tokio
//! - Run-scoped workspaces for transient segment and result files
//! - Segmentation, per-pair synthesis and concat reassembly behind traits
//!   so the orchestrator can be driven by test doubles

pub mod command;
pub mod error;
pub mod ffmpeg;
pub mod fs_utils;
pub mod progress;
pub mod reassembler;
pub mod segmenter;
pub mod synthesis;
pub mod workspace;

pub use command::{
    check_tool, InvokeOptions, LineSink, OutputStream, ProcessRunner,
    SystemInvoker, ToolCommand, ToolInvoker, ToolOutcome,
};
pub use error::{MediaError, MediaResult};
pub use ffmpeg::FfmpegCommand;
pub use fs_utils::{copy_file, move_file};
pub use progress::{channel as progress_channel, ProgressReceiver, ProgressSender};
pub use reassembler::{write_manifest, FfmpegReassembler, Reassembler};
pub use segmenter::{FfmpegSegmenter, PassthroughMode, Segmenter};
pub use synthesis::{ArgumentStyle, SynthesisTool, Synthesizer, ToolSynthesizer};
pub use workspace::{CleanupWarning, Workspace, WorkspaceDir};
