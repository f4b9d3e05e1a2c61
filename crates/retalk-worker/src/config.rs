//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use retalk_media::{ArgumentStyle, PassthroughMode, SynthesisTool};

use crate::error::{PipelineError, PipelineResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root under which run namespaces are created
    pub work_dir: PathBuf,
    /// Where final outputs are written
    pub output_dir: PathBuf,
    /// FFmpeg binary
    pub ffmpeg: String,
    /// Synthesis tool invocation shape
    pub synthesis: SynthesisTool,
    /// Deadline for one synthesis invocation
    pub synthesis_timeout: Option<Duration>,
    /// Pairs synthesized at once; 1 means strictly sequential
    pub synthesis_parallelism: usize,
    /// How unsegmented inputs enter the workspace
    pub passthrough: PassthroughMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/retalk"),
            output_dir: PathBuf::from("/tmp/retalk/results"),
            ffmpeg: "ffmpeg".to_string(),
            synthesis: SynthesisTool::default(),
            synthesis_timeout: None,
            synthesis_parallelism: 1,
            passthrough: PassthroughMode::Copy,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut synthesis = defaults.synthesis.clone();
        if let Some(program) = lookup("RETALK_SYNTH_PROGRAM").filter(|s| !s.trim().is_empty()) {
            synthesis.program = program.trim().to_string();
        }
        if let Some(args) = lookup("RETALK_SYNTH_ARGS") {
            synthesis = synthesis.with_args(args.split_whitespace());
        }
        if lookup("RETALK_SYNTH_POSITIONAL")
            .map(|v| parse_bool(&v))
            .unwrap_or(false)
        {
            synthesis = synthesis.with_style(ArgumentStyle::Positional);
        }

        Self {
            work_dir: lookup("RETALK_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            output_dir: lookup("RETALK_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            ffmpeg: lookup("RETALK_FFMPEG").unwrap_or(defaults.ffmpeg),
            synthesis,
            synthesis_timeout: lookup("RETALK_SYNTH_TIMEOUT_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            synthesis_parallelism: lookup("RETALK_SYNTH_PARALLELISM")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.synthesis_parallelism),
            passthrough: if lookup("RETALK_PASSTHROUGH_MOVE")
                .map(|v| parse_bool(&v))
                .unwrap_or(false)
            {
                PassthroughMode::Move
            } else {
                PassthroughMode::Copy
            },
        }
    }

    /// Check values that would make every run fail.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.synthesis_parallelism == 0 {
            return Err(PipelineError::config("synthesis parallelism must be at least 1"));
        }
        if self.synthesis.program.trim().is_empty() {
            return Err(PipelineError::config("synthesis program is empty"));
        }
        if self.ffmpeg.trim().is_empty() {
            return Err(PipelineError::config("ffmpeg binary is empty"));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
