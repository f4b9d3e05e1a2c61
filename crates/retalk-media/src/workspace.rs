//! Run-scoped workspaces for transient segment and result files.
//!
//! Every run owns `<work_root>/run-<id>/` with one subdirectory per
//! [`WorkspaceDir`]. Nothing outside that namespace is ever reset or
//! removed, so concurrent runs sharing a work root cannot collide.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use retalk_models::{MediaKind, RunId};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Subdirectories of a run namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceDir {
    VideoSegments,
    AudioSegments,
    Results,
}

impl WorkspaceDir {
    pub const ALL: [WorkspaceDir; 3] = [
        WorkspaceDir::VideoSegments,
        WorkspaceDir::AudioSegments,
        WorkspaceDir::Results,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceDir::VideoSegments => "video",
            WorkspaceDir::AudioSegments => "audio",
            WorkspaceDir::Results => "results",
        }
    }

    /// Directory holding segments of the given kind.
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => WorkspaceDir::VideoSegments,
            MediaKind::Audio => WorkspaceDir::AudioSegments,
        }
    }
}

/// A file that could not be removed during cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

impl CleanupWarning {
    fn new(path: &Path, err: &std::io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {}: {}", self.path.display(), self.message)
    }
}

/// Filesystem namespace owned by one run.
#[derive(Debug, Clone)]
pub struct Workspace {
    run_id: RunId,
    root: PathBuf,
}

impl Workspace {
    pub fn new(work_root: impl AsRef<Path>, run_id: &RunId) -> Self {
        Self {
            run_id: run_id.clone(),
            root: work_root.as_ref().join(format!("run-{}", run_id)),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: WorkspaceDir) -> PathBuf {
        self.root.join(dir.as_str())
    }

    /// Output location for the synthesized segment at `index`.
    pub fn result_path(&self, index: u32) -> PathBuf {
        self.dir(WorkspaceDir::Results)
            .join(format!("segment_{:03}.mp4", index))
    }

    /// Location of the concat manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir(WorkspaceDir::Results).join("concat.txt")
    }

    /// Ensure `dir` exists.
    pub async fn prepare(&self, dir: WorkspaceDir) -> MediaResult<PathBuf> {
        let path = self.dir(dir);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| MediaError::workspace(&path, e))?;
        Ok(path)
    }

    /// Discard everything in `dir` and recreate it empty.
    pub async fn reset(&self, dir: WorkspaceDir) -> MediaResult<PathBuf> {
        let path = self.dir(dir);
        match fs::remove_dir_all(&path).await {
            Ok(()) => debug!("Reset {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(MediaError::workspace(&path, e)),
        }
        self.prepare(dir).await
    }

    /// Remove each listed file. Missing files are fine; other failures
    /// become warnings and the remaining files are still attempted.
    pub async fn cleanup(&self, paths: &[PathBuf]) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        for path in paths {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), "Cleanup failed: {}", e);
                    warnings.push(CleanupWarning::new(path, &e));
                }
            }
        }
        warnings
    }

    /// Remove every transient file of this run, then the namespace itself.
    pub async fn teardown(&self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();

        for dir in WorkspaceDir::ALL {
            let path = self.dir(dir);
            let files = match list_files(&path).await {
                Ok(files) => files,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warnings.push(CleanupWarning::new(&path, &e));
                    continue;
                }
            };
            warnings.extend(self.cleanup(&files).await);
        }

        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.root.display(), "Could not remove run directory: {}", e);
                warnings.push(CleanupWarning::new(&self.root, &e));
            }
        }

        warnings
    }
}

async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}
