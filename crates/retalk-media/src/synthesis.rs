//! Per-pair invocation of the external lip-sync synthesis tool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use retalk_models::{FailureReason, SegmentPair, SynthesisResult};
use tokio::fs;
use tokio::sync::watch;
use tracing::{info, warn, Span};

use crate::command::{InvokeOptions, LineSink, OutputStream, ToolCommand, ToolInvoker};
use crate::error::{MediaError, MediaResult};

/// How the three file arguments are passed to the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgumentStyle {
    /// `--face <video> --audio <audio> --outfile <output>`
    #[default]
    Flagged,
    /// `<video> <audio> <output>`
    Positional,
}

/// Invocation shape of the synthesis tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisTool {
    pub program: String,
    /// Leading arguments, before the file arguments
    pub args: Vec<String>,
    pub style: ArgumentStyle,
    pub face_flag: String,
    pub audio_flag: String,
    pub outfile_flag: String,
}

impl Default for SynthesisTool {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-u".to_string(), "inference.py".to_string()],
            style: ArgumentStyle::Flagged,
            face_flag: "--face".to_string(),
            audio_flag: "--audio".to_string(),
            outfile_flag: "--outfile".to_string(),
        }
    }
}

impl SynthesisTool {
    /// A tool with no leading arguments and the default flags.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_style(mut self, style: ArgumentStyle) -> Self {
        self.style = style;
        self
    }

    /// Build the command for one pair.
    pub fn command(&self, video: &Path, audio: &Path, output: &Path) -> ToolCommand {
        let cmd = ToolCommand::new(&self.program).args(self.args.iter().cloned());
        match self.style {
            ArgumentStyle::Flagged => cmd
                .arg(&self.face_flag)
                .path_arg(video)
                .arg(&self.audio_flag)
                .path_arg(audio)
                .arg(&self.outfile_flag)
                .path_arg(output),
            ArgumentStyle::Positional => cmd.path_arg(video).path_arg(audio).path_arg(output),
        }
    }
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one pair into `output_path`.
    ///
    /// A tool that runs and fails yields `Ok` with a failed result; `Err` is
    /// reserved for problems launching it.
    async fn synthesize(
        &self,
        pair: &SegmentPair,
        output_path: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SynthesisResult>;
}

/// [`Synthesizer`] running a [`SynthesisTool`] as a subprocess.
#[derive(Clone)]
pub struct ToolSynthesizer {
    invoker: Arc<dyn ToolInvoker>,
    tool: SynthesisTool,
    timeout: Option<Duration>,
}

impl ToolSynthesizer {
    pub fn new(invoker: Arc<dyn ToolInvoker>, tool: SynthesisTool) -> Self {
        Self {
            invoker,
            tool,
            timeout: None,
        }
    }

    /// Kill the tool if a single pair takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Forward tool output to tracing, inside the caller's span.
fn log_sink(index: u32) -> LineSink {
    let span = Span::current();
    Arc::new(move |stream, line| {
        let _enter = span.enter();
        match stream {
            OutputStream::Stdout => info!(segment = index, stream = stream.as_str(), "{}", line),
            OutputStream::Stderr => warn!(segment = index, stream = stream.as_str(), "{}", line),
        }
    })
}

#[async_trait]
impl Synthesizer for ToolSynthesizer {
    async fn synthesize(
        &self,
        pair: &SegmentPair,
        output_path: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SynthesisResult> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaError::workspace(parent, e))?;
        }

        let cmd = self
            .tool
            .command(pair.video.path(), pair.audio.path(), output_path);
        info!(segment = pair.index, "Synthesizing: {}", cmd);

        let options = InvokeOptions::new()
            .with_timeout(self.timeout)
            .with_cancel(cancel)
            .with_sink(log_sink(pair.index));

        let index = pair.index;
        match self.invoker.invoke(&cmd, options).await {
            Ok(outcome) if outcome.success => Ok(SynthesisResult::succeeded(index, output_path)),
            Ok(outcome) => {
                warn!(segment = index, exit_code = ?outcome.exit_code, "Synthesis tool failed");
                Ok(SynthesisResult::failed(
                    index,
                    output_path,
                    FailureReason::ExitStatus {
                        code: outcome.exit_code,
                    },
                ))
            }
            Err(MediaError::Timeout(after_secs)) => Ok(SynthesisResult::failed(
                index,
                output_path,
                FailureReason::TimedOut { after_secs },
            )),
            Err(MediaError::Cancelled) => Ok(SynthesisResult::failed(
                index,
                output_path,
                FailureReason::Cancelled,
            )),
            Err(e) => Err(e),
        }
    }
}
