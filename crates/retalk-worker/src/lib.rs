//! Segmented lip-sync pipeline.
//!
//! This crate provides:
//! - The pipeline orchestrator and its stage machine
//! - Index-aligned pairing of video and audio segments
//! - Configuration, structured run logging and metrics
//! - The `retalk` command-line entry point

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;

pub use config::WorkerConfig;
pub use dispatcher::dispatch;
pub use error::{PipelineError, PipelineResult};
pub use logging::{init_tracing, RunLogger};
pub use pipeline::{PipelineOrchestrator, PipelineOutcome};
