//! Concatenation of synthesized segments into the final output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use retalk_models::SynthesisResult;
use tokio::fs;
use tokio::sync::watch;
use tracing::info;

use crate::command::{InvokeOptions, ToolInvoker};
use crate::error::{MediaError, MediaResult};
use crate::ffmpeg::FfmpegCommand;
use crate::workspace::{Workspace, WorkspaceDir};

#[async_trait]
pub trait Reassembler: Send + Sync {
    /// Join `outputs` in order into `destination`.
    async fn concatenate(
        &self,
        workspace: &Workspace,
        outputs: &[SynthesisResult],
        destination: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<PathBuf>;
}

/// [`Reassembler`] using the ffmpeg concat demuxer with stream copy.
#[derive(Clone)]
pub struct FfmpegReassembler {
    invoker: Arc<dyn ToolInvoker>,
    ffmpeg: String,
}

impl FfmpegReassembler {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            ffmpeg: "ffmpeg".to_string(),
        }
    }

    /// Use a specific ffmpeg binary.
    pub fn with_ffmpeg(mut self, binary: impl Into<String>) -> Self {
        self.ffmpeg = binary.into();
        self
    }
}

/// Outputs must be non-empty, successful, and indexed 0..N in order.
fn validate(outputs: &[SynthesisResult]) -> MediaResult<()> {
    if outputs.is_empty() {
        return Err(MediaError::invalid_argument("nothing to concatenate"));
    }
    for (position, result) in outputs.iter().enumerate() {
        if result.index as usize != position {
            return Err(MediaError::InvalidSegments(format!(
                "expected segment {} at position {}, found {}",
                position, position, result.index
            )));
        }
        if let Some(reason) = result.failure_reason() {
            return Err(MediaError::InvalidSegments(format!(
                "segment {} did not succeed: {}",
                result.index, reason
            )));
        }
    }
    Ok(())
}

/// One `file '<path>'` line, with single quotes escaped for the concat demuxer.
fn manifest_line(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{}'\n", escaped)
}

/// Write a concat manifest listing `entries` in order.
///
/// Relative entries are resolved against the current directory, since the
/// demuxer would otherwise resolve them against the manifest's location.
pub async fn write_manifest(manifest: &Path, entries: &[PathBuf]) -> MediaResult<()> {
    let cwd = std::env::current_dir()?;
    let body: String = entries
        .iter()
        .map(|entry| {
            if entry.is_absolute() {
                manifest_line(entry)
            } else {
                manifest_line(&cwd.join(entry))
            }
        })
        .collect();

    fs::write(manifest, body)
        .await
        .map_err(|e| MediaError::workspace(manifest, e))
}

#[async_trait]
impl Reassembler for FfmpegReassembler {
    async fn concatenate(
        &self,
        workspace: &Workspace,
        outputs: &[SynthesisResult],
        destination: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<PathBuf> {
        validate(outputs)?;

        workspace.prepare(WorkspaceDir::Results).await?;
        let manifest = workspace.manifest_path();
        let entries: Vec<PathBuf> = outputs.iter().map(|r| r.output_path.clone()).collect();
        write_manifest(&manifest, &entries).await?;

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MediaError::workspace(parent, e))?;
            }
        }

        let cmd = FfmpegCommand::new(&manifest, destination)
            .concat_input()
            .codec_copy()
            .build(&self.ffmpeg);

        info!(
            segments = outputs.len(),
            "Concatenating into {}",
            destination.display()
        );

        self.invoker
            .invoke(&cmd, InvokeOptions::new().with_cancel(cancel))
            .await?
            .check("ffmpeg")?;

        Ok(destination.to_path_buf())
    }
}
