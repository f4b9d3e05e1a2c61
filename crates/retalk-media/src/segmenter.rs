//! Splitting inputs into fixed-duration segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use retalk_models::{MediaAsset, MediaKind, SegmentSequence};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{InvokeOptions, ToolInvoker};
use crate::error::{MediaError, MediaResult};
use crate::ffmpeg::FfmpegCommand;
use crate::fs_utils::{copy_file, move_file};
use crate::workspace::{Workspace, WorkspaceDir};

/// How an unsegmented input is placed into the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassthroughMode {
    /// Copy, leaving the caller's file untouched
    #[default]
    Copy,
    /// Move (rename) the caller's file into the workspace
    Move,
}

#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Split `asset` into consecutive pieces of `duration_secs` seconds
    /// (the last one may be shorter).
    async fn split(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
        duration_secs: f64,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SegmentSequence>;

    /// Place `asset` into the workspace as a one-element sequence.
    async fn passthrough(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
    ) -> MediaResult<SegmentSequence>;
}

/// [`Segmenter`] driving the ffmpeg segment muxer.
#[derive(Clone)]
pub struct FfmpegSegmenter {
    invoker: Arc<dyn ToolInvoker>,
    ffmpeg: String,
    passthrough: PassthroughMode,
}

impl FfmpegSegmenter {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            ffmpeg: "ffmpeg".to_string(),
            passthrough: PassthroughMode::default(),
        }
    }

    /// Use a specific ffmpeg binary.
    pub fn with_ffmpeg(mut self, binary: impl Into<String>) -> Self {
        self.ffmpeg = binary.into();
        self
    }

    pub fn with_passthrough(mut self, mode: PassthroughMode) -> Self {
        self.passthrough = mode;
        self
    }
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn split(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
        duration_secs: f64,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SegmentSequence> {
        if !(duration_secs.is_finite() && duration_secs > 0.0) {
            return Err(MediaError::invalid_argument(format!(
                "segment duration must be positive, got {}",
                duration_secs
            )));
        }
        if !asset.path().exists() {
            return Err(MediaError::FileNotFound(asset.path().to_path_buf()));
        }

        let dir = workspace.reset(WorkspaceDir::for_kind(asset.kind)).await?;
        let ext = asset.extension();
        let prefix = segment_prefix(asset.kind);
        let template = dir.join(format!("{}%03d.{}", prefix, ext));

        let cmd = FfmpegCommand::new(asset.path(), &template)
            .codec_copy()
            .map_all()
            .segment(duration_secs)
            .build(&self.ffmpeg);

        info!(
            kind = asset.kind.as_str(),
            duration_secs,
            "Splitting {}",
            asset.path().display()
        );

        self.invoker
            .invoke(&cmd, InvokeOptions::new().with_cancel(cancel))
            .await?
            .check("ffmpeg")?;

        let sequence = collect_segments(&dir, &prefix, &ext, asset.kind).await?;
        info!(
            kind = asset.kind.as_str(),
            count = sequence.len(),
            "Segmentation complete"
        );
        Ok(sequence)
    }

    async fn passthrough(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
    ) -> MediaResult<SegmentSequence> {
        let src = asset.path();
        let file_name = src
            .file_name()
            .ok_or_else(|| MediaError::invalid_argument(format!("not a file: {}", src.display())))?;

        let dir = workspace.reset(WorkspaceDir::for_kind(asset.kind)).await?;
        let dst = dir.join(file_name);

        match self.passthrough {
            PassthroughMode::Copy => copy_file(src, &dst).await?,
            PassthroughMode::Move => move_file(src, &dst).await?,
        }

        debug!(
            kind = asset.kind.as_str(),
            "Passing {} through unsegmented",
            src.display()
        );
        Ok(SegmentSequence::single(dst, asset.kind))
    }
}

/// `<kind>_<8 hex>_`, unique per invocation.
fn segment_prefix(kind: MediaKind) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("{}_{}_", kind.as_str(), &tag[..8])
}

/// Find the files ffmpeg wrote for `prefix`, ordered by their numeric suffix.
async fn collect_segments(
    dir: &Path,
    prefix: &str,
    ext: &str,
    kind: MediaKind,
) -> MediaResult<SegmentSequence> {
    let suffix = format!(".{}", ext);
    let mut found: Vec<(u32, PathBuf)> = Vec::new();

    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| MediaError::workspace(dir, e))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let index = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix.as_str()))
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(index) = index {
            found.push((index, entry.path()));
        }
    }

    found.sort_by_key(|(index, _)| *index);

    let segments = found
        .into_iter()
        .map(|(index, path)| MediaAsset::segment(path, kind, index))
        .collect();

    SegmentSequence::new(segments)
        .map_err(|e| MediaError::InvalidSegments(format!("{} segments: {}", kind, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ToolCommand, ToolOutcome};
    use retalk_models::RunId;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes `pieces` files at the segment template, skipping `skip`.
    struct FakeFfmpeg {
        pieces: u32,
        skip: Option<u32>,
        exit_code: i32,
        calls: Mutex<Vec<ToolCommand>>,
    }

    impl FakeFfmpeg {
        fn new(pieces: u32) -> Self {
            Self {
                pieces,
                skip: None,
                exit_code: 0,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeFfmpeg {
        async fn invoke(
            &self,
            cmd: &ToolCommand,
            _options: InvokeOptions,
        ) -> MediaResult<ToolOutcome> {
            self.calls.lock().unwrap().push(cmd.clone());
            if self.exit_code == 0 {
                let template = cmd.arguments().last().unwrap().clone();
                for i in 0..self.pieces {
                    if Some(i) == self.skip {
                        continue;
                    }
                    let path = template.replace("%03d", &format!("{:03}", i));
                    fs::write(path, b"segment").await.unwrap();
                }
            }
            Ok(ToolOutcome {
                exit_code: Some(self.exit_code),
                success: self.exit_code == 0,
                stderr_tail: vec!["Invalid data found when processing input".to_string()],
            })
        }
    }

    async fn setup(name: &str) -> (TempDir, Workspace, MediaAsset) {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join(name);
        fs::write(&input, b"input").await.unwrap();
        let ws = Workspace::new(temp.path().join("work"), &RunId::new());
        let asset = MediaAsset::video(input);
        (temp, ws, asset)
    }

    #[tokio::test]
    async fn test_split_orders_segments() {
        let (_temp, ws, asset) = setup("face.mp4").await;
        let fake = Arc::new(FakeFfmpeg::new(12));
        let segmenter = FfmpegSegmenter::new(fake.clone());

        let seq = segmenter.split(&ws, &asset, 5.0, None).await.unwrap();

        assert_eq!(seq.len(), 12);
        for (i, seg) in seq.iter().enumerate() {
            assert_eq!(seg.index, Some(i as u32));
            assert!(seg.path.starts_with(ws.dir(WorkspaceDir::VideoSegments)));
        }
        assert!(seq.get(11).unwrap().path.to_string_lossy().ends_with("_011.mp4"));

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments().contains(&"-segment_time".to_string()));
    }

    #[tokio::test]
    async fn test_split_ignores_stale_files() {
        let (_temp, ws, asset) = setup("face.mp4").await;
        let dir = ws.prepare(WorkspaceDir::VideoSegments).await.unwrap();
        fs::write(dir.join("video_deadbeef_000.mp4"), b"old").await.unwrap();

        let segmenter = FfmpegSegmenter::new(Arc::new(FakeFfmpeg::new(2)));
        let seq = segmenter.split(&ws, &asset, 3.0, None).await.unwrap();

        assert_eq!(seq.len(), 2);
        assert!(!dir.join("video_deadbeef_000.mp4").exists());
    }

    #[tokio::test]
    async fn test_split_rejects_gap() {
        let (_temp, ws, asset) = setup("face.mp4").await;
        let mut fake = FakeFfmpeg::new(4);
        fake.skip = Some(2);
        let segmenter = FfmpegSegmenter::new(Arc::new(fake));

        let err = segmenter.split(&ws, &asset, 5.0, None).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidSegments(_)));
    }

    #[tokio::test]
    async fn test_split_tool_failure() {
        let (_temp, ws, asset) = setup("face.mp4").await;
        let mut fake = FakeFfmpeg::new(0);
        fake.exit_code = 1;
        let segmenter = FfmpegSegmenter::new(Arc::new(fake));

        let err = segmenter.split(&ws, &asset, 5.0, None).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.stderr().unwrap().contains("Invalid data"));
    }

    #[tokio::test]
    async fn test_split_preconditions() {
        let (temp, ws, asset) = setup("face.mp4").await;
        let fake = Arc::new(FakeFfmpeg::new(1));
        let segmenter = FfmpegSegmenter::new(fake.clone());

        for bad in [0.0, -1.0, f64::NAN] {
            let err = segmenter.split(&ws, &asset, bad, None).await.unwrap_err();
            assert!(matches!(err, MediaError::InvalidArgument(_)));
        }

        let missing = MediaAsset::audio(temp.path().join("missing.wav"));
        let err = segmenter.split(&ws, &missing, 5.0, None).await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));

        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_copy_and_move() {
        let (_temp, ws, asset) = setup("face.mp4").await;
        let fake = Arc::new(FakeFfmpeg::new(0));

        let seq = FfmpegSegmenter::new(fake.clone())
            .passthrough(&ws, &asset)
            .await
            .unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.get(0).unwrap().index, Some(0));
        assert!(seq.get(0).unwrap().path.exists());
        assert!(asset.path().exists());

        let seq = FfmpegSegmenter::new(fake.clone())
            .with_passthrough(PassthroughMode::Move)
            .passthrough(&ws, &asset)
            .await
            .unwrap();
        assert!(seq.get(0).unwrap().path.exists());
        assert!(!asset.path().exists());

        assert!(fake.calls.lock().unwrap().is_empty());
    }
}
