//! Command builder and process runner for external tools.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Stderr lines kept for error reports.
const DEFAULT_STDERR_TAIL: usize = 20;

/// How long output readers may keep going once the process has exited.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Builder for an external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program name or path
    program: String,
    /// Arguments, in order
    args: Vec<String>,
}

impl ToolCommand {
    /// Create a new command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a path argument.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument list, excluding the program.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Which standard stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Callback receiving each output line as it arrives.
pub type LineSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// How a finished process exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Last stderr lines, oldest first
    pub stderr_tail: Vec<String>,
}

impl ToolOutcome {
    /// Captured stderr tail as one string.
    pub fn stderr_text(&self) -> Option<String> {
        if self.stderr_tail.is_empty() {
            None
        } else {
            Some(self.stderr_tail.join("\n"))
        }
    }

    /// Turn a non-zero exit into a [`MediaError::ToolFailed`].
    pub fn check(self, tool: &str) -> MediaResult<Self> {
        if self.success {
            return Ok(self);
        }
        let message = match self.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        };
        Err(MediaError::tool_failed(
            tool,
            message,
            self.stderr_text(),
            self.exit_code,
        ))
    }
}

/// Runner for external processes with line capture, deadline and cancellation.
pub struct ProcessRunner {
    /// Cancellation signal receiver
    cancel_rx: Option<watch::Receiver<bool>>,
    /// Deadline for the whole process
    timeout: Option<Duration>,
    /// Number of stderr lines retained in the outcome
    stderr_tail: usize,
    /// Limit on reading leftover output after exit
    drain_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self {
            cancel_rx: None,
            timeout: None,
            stderr_tail: DEFAULT_STDERR_TAIL,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Set cancellation signal.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// Set timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many stderr lines to keep.
    pub fn with_stderr_tail(mut self, lines: usize) -> Self {
        self.stderr_tail = lines;
        self
    }

    /// Set how long to keep reading output after the process exits.
    ///
    /// Descendants that inherited the pipes can hold them open; their
    /// readers are abandoned once this elapses.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Run a command, discarding its output lines.
    pub async fn run(&self, cmd: &ToolCommand) -> MediaResult<ToolOutcome> {
        self.run_with_lines(cmd, None).await
    }

    /// Run a command, forwarding each output line to `sink` as it arrives.
    pub async fn run_with_lines(
        &self,
        cmd: &ToolCommand,
        sink: Option<LineSink>,
    ) -> MediaResult<ToolOutcome> {
        debug!("Running: {}", cmd);

        let mut child = Command::new(cmd.program())
            .args(cmd.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::ToolNotFound(cmd.program().to_string()),
                _ => MediaError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("stderr not captured"))?;

        let stdout_task = tokio::spawn(pump_lines(stdout, OutputStream::Stdout, sink.clone(), 0));
        let stderr_task = tokio::spawn(pump_lines(
            stderr,
            OutputStream::Stderr,
            sink,
            self.stderr_tail,
        ));

        let status = match self.wait_for_completion(&mut child).await {
            Ok(status) => status,
            Err(e) => {
                // Orphaned grandchildren may keep the pipes open.
                stdout_task.abort();
                stderr_task.abort();
                return Err(e);
            }
        };

        let drain_deadline = tokio::time::Instant::now() + self.drain_grace;
        let _ = drain(stdout_task, drain_deadline).await;
        let stderr_tail = drain(stderr_task, drain_deadline)
            .await
            .unwrap_or_default();

        Ok(ToolOutcome {
            exit_code: status.code(),
            success: status.success(),
            stderr_tail: stderr_tail.into(),
        })
    }

    /// Wait for child process with cancellation and timeout.
    async fn wait_for_completion(&self, child: &mut Child) -> MediaResult<ExitStatus> {
        let mut cancel_rx = self.cancel_rx.clone();
        let cancelled = async move {
            match cancel_rx.as_mut() {
                Some(rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone: cancellation can no longer happen.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let interrupted = tokio::select! {
            status = child.wait() => return Ok(status?),
            _ = deadline => {
                let secs = timeout.map(whole_seconds).unwrap_or_default();
                warn!("Process timed out after {:?}, killing it", timeout);
                MediaError::Timeout(secs)
            }
            _ = cancelled => {
                info!("Process cancelled, killing it");
                MediaError::Cancelled
            }
        };

        let _ = child.kill().await;
        Err(interrupted)
    }
}

/// Seconds in `duration`, rounded up so short deadlines never read as 0.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Await a reader task until `deadline`, aborting it if it is still running.
async fn drain<T>(mut task: JoinHandle<T>, deadline: tokio::time::Instant) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            warn!("Output pipe still open after process exit, abandoning reader");
            task.abort();
            None
        }
    }
}

/// Read `reader` line by line until EOF, forwarding to `sink` and keeping
/// the last `keep` lines.
async fn pump_lines<R>(
    reader: R,
    stream: OutputStream,
    sink: Option<LineSink>,
    keep: usize,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(keep);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let decoded = String::from_utf8_lossy(&buf);
                let line = decoded.trim_end_matches(&['\r', '\n'][..]);
                if let Some(sink) = &sink {
                    sink(stream, line);
                }
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Err(e) => {
                debug!("Stopped reading {}: {}", stream.as_str(), e);
                break;
            }
        }
    }

    tail
}

/// Per-invocation options for a [`ToolInvoker`].
#[derive(Clone, Default)]
pub struct InvokeOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<watch::Receiver<bool>>,
    pub sink: Option<LineSink>,
}

impl InvokeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: LineSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Narrow interface to anything that can run a tool command.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, cmd: &ToolCommand, options: InvokeOptions) -> MediaResult<ToolOutcome>;
}

/// [`ToolInvoker`] that spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemInvoker;

#[async_trait]
impl ToolInvoker for SystemInvoker {
    async fn invoke(&self, cmd: &ToolCommand, options: InvokeOptions) -> MediaResult<ToolOutcome> {
        let mut runner = ProcessRunner::new();
        if let Some(timeout) = options.timeout {
            runner = runner.with_timeout(timeout);
        }
        if let Some(cancel) = options.cancel {
            runner = runner.with_cancel(cancel);
        }
        runner.run_with_lines(cmd, options.sink).await
    }
}

/// Resolve a tool in PATH (or as a path).
pub fn check_tool(name: &str) -> MediaResult<PathBuf> {
    which::which(name).map_err(|_| MediaError::ToolNotFound(name.to_string()))
}
