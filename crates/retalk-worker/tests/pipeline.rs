//! Orchestrator behavior with deterministic in-process collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;
use tokio::sync::watch;

use retalk_media::{
    progress_channel, MediaError, MediaResult, Reassembler, Segmenter, Synthesizer, Workspace,
    WorkspaceDir,
};
use retalk_models::{
    FailureReason, MediaAsset, MediaKind, PipelineRun, PipelineStage, ProgressEvent, SegmentPair,
    SegmentSequence, SynthesisResult,
};
use retalk_worker::{PipelineError, PipelineOrchestrator, WorkerConfig};

/// Writes `<input contents>#<i>` into each segment file.
#[derive(Default)]
struct StubSegmenter {
    video_pieces: u32,
    audio_pieces: u32,
    fail_kind: Option<MediaKind>,
    /// Block until cancelled
    hang: bool,
    split_calls: Mutex<Vec<(MediaKind, f64)>>,
    passthrough_calls: Mutex<Vec<MediaKind>>,
}

impl StubSegmenter {
    fn new(video_pieces: u32, audio_pieces: u32) -> Self {
        Self {
            video_pieces,
            audio_pieces,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Segmenter for StubSegmenter {
    async fn split(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
        duration_secs: f64,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SegmentSequence> {
        self.split_calls
            .lock()
            .unwrap()
            .push((asset.kind, duration_secs));

        if self.hang {
            wait_for_cancel(cancel).await;
            return Err(MediaError::Cancelled);
        }

        if self.fail_kind == Some(asset.kind) {
            return Err(MediaError::tool_failed(
                "ffmpeg",
                "exited with status 1",
                Some("Invalid data found when processing input".to_string()),
                Some(1),
            ));
        }

        let pieces = match asset.kind {
            MediaKind::Video => self.video_pieces,
            MediaKind::Audio => self.audio_pieces,
        };
        let source = fs::read_to_string(asset.path()).await?;
        let dir = workspace.reset(WorkspaceDir::for_kind(asset.kind)).await?;

        let mut segments = Vec::new();
        for i in 0..pieces {
            let path = dir.join(format!("{}_{:03}.{}", asset.kind, i, asset.extension()));
            fs::write(&path, format!("{}#{}", source.trim(), i)).await?;
            segments.push(MediaAsset::segment(path, asset.kind, i));
        }
        SegmentSequence::new(segments).map_err(|e| MediaError::InvalidSegments(e.to_string()))
    }

    async fn passthrough(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
    ) -> MediaResult<SegmentSequence> {
        self.passthrough_calls.lock().unwrap().push(asset.kind);
        let dir = workspace.reset(WorkspaceDir::for_kind(asset.kind)).await?;
        let dst = dir.join(asset.path().file_name().unwrap());
        fs::copy(asset.path(), &dst).await?;
        Ok(SegmentSequence::single(dst, asset.kind))
    }
}

#[derive(Default)]
struct StubSynthesizer {
    fail_at: Option<u32>,
    /// Block until cancelled
    hang: bool,
    /// Later indices finish faster
    stagger: bool,
    calls: Mutex<Vec<u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    async fn synthesize(
        &self,
        pair: &SegmentPair,
        output_path: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<SynthesisResult> {
        self.calls.lock().unwrap().push(pair.index);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.hang {
            wait_for_cancel(cancel).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Ok(SynthesisResult::failed(
                pair.index,
                output_path,
                FailureReason::Cancelled,
            ));
        }

        if self.stagger {
            let millis = 20 * (8u64.saturating_sub(pair.index as u64));
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_at == Some(pair.index) {
            return Ok(SynthesisResult::failed(
                pair.index,
                output_path,
                FailureReason::ExitStatus { code: Some(1) },
            ));
        }

        fs::create_dir_all(output_path.parent().unwrap()).await?;
        fs::copy(pair.video.path(), output_path).await?;
        Ok(SynthesisResult::succeeded(pair.index, output_path))
    }
}

/// Joins segment contents with `|`.
#[derive(Default)]
struct StubReassembler {
    /// Leave a truncated destination behind, then exit 1
    fail: bool,
    /// Leave a truncated destination behind, then block until cancelled
    hang: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Reassembler for StubReassembler {
    async fn concatenate(
        &self,
        _workspace: &Workspace,
        outputs: &[SynthesisResult],
        destination: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(destination.parent().unwrap()).await?;

        if self.fail || self.hang {
            fs::write(destination, "truncated").await?;
            if self.hang {
                wait_for_cancel(cancel).await;
                return Err(MediaError::Cancelled);
            }
            return Err(MediaError::tool_failed(
                "ffmpeg",
                "exited with status 1",
                Some("Non-monotonous DTS in output stream".to_string()),
                Some(1),
            ));
        }

        let mut parts = Vec::new();
        for result in outputs {
            parts.push(fs::read_to_string(&result.output_path).await?);
        }
        fs::write(destination, parts.join("|")).await?;
        Ok(destination.to_path_buf())
    }
}

async fn wait_for_cancel(cancel: Option<watch::Receiver<bool>>) {
    let mut rx = cancel.expect("cancel receiver");
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

struct Harness {
    temp: TempDir,
    segmenter: Arc<StubSegmenter>,
    synthesizer: Arc<StubSynthesizer>,
    reassembler: Arc<StubReassembler>,
    parallelism: usize,
}

impl Harness {
    fn new(segmenter: StubSegmenter, synthesizer: StubSynthesizer) -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            segmenter: Arc::new(segmenter),
            synthesizer: Arc::new(synthesizer),
            reassembler: Arc::new(StubReassembler::default()),
            parallelism: 1,
        }
    }

    fn with_reassembler(mut self, reassembler: StubReassembler) -> Self {
        self.reassembler = Arc::new(reassembler);
        self
    }

    fn work_dir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    fn output_dir(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        let config = WorkerConfig {
            work_dir: self.work_dir(),
            output_dir: self.output_dir(),
            synthesis_parallelism: self.parallelism,
            ..WorkerConfig::default()
        };
        PipelineOrchestrator::new(
            config,
            self.segmenter.clone(),
            self.synthesizer.clone(),
            self.reassembler.clone(),
        )
    }

    async fn inputs(&self, tag: &str) -> (PathBuf, PathBuf) {
        let video = self.temp.path().join(format!("{}.mp4", tag));
        let audio = self.temp.path().join(format!("{}.wav", tag));
        fs::write(&video, tag).await.unwrap();
        fs::write(&audio, format!("{}-audio", tag)).await.unwrap();
        (video, audio)
    }

    fn synth_calls(&self) -> Vec<u32> {
        self.synthesizer.calls.lock().unwrap().clone()
    }

    async fn work_dir_is_empty(&self) -> bool {
        dir_is_empty(&self.work_dir()).await
    }

    async fn output_dir_is_empty(&self) -> bool {
        dir_is_empty(&self.output_dir()).await
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => entries.next_entry().await.unwrap().is_none(),
        Err(_) => true,
    }
}

fn cancel_after(delay: Duration) -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = cancel_tx.send(true);
    });
    cancel_rx
}

fn stages(events: &[ProgressEvent]) -> Vec<PipelineStage> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StageChanged { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn passthrough_invokes_synthesis_once() {
    let harness = Harness::new(StubSegmenter::new(9, 9), StubSynthesizer::default());
    let (video, audio) = harness.inputs("clip").await;

    let output = harness
        .orchestrator()
        .convert(0.0, &video, &audio)
        .await
        .unwrap();

    assert_eq!(harness.synth_calls(), vec![0]);
    assert!(harness.segmenter.split_calls.lock().unwrap().is_empty());
    assert_eq!(harness.segmenter.passthrough_calls.lock().unwrap().len(), 2);
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(&output).await.unwrap(), "clip");
    assert!(video.exists());
}

#[tokio::test]
async fn segmented_run_synthesizes_every_pair_in_order() {
    let harness = Harness::new(StubSegmenter::new(4, 4), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let output = harness
        .orchestrator()
        .convert(5.0, &video, &audio)
        .await
        .unwrap();

    assert_eq!(harness.synth_calls(), vec![0, 1, 2, 3]);
    let calls = harness.segmenter.split_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, secs)| *secs == 5.0));
    assert_eq!(
        fs::read_to_string(&output).await.unwrap(),
        "face#0|face#1|face#2|face#3"
    );
    assert!(output.starts_with(harness.output_dir()));
}

#[tokio::test]
async fn count_mismatch_fails_before_synthesis() {
    let harness = Harness::new(StubSegmenter::new(3, 2), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .convert(5.0, &video, &audio)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::SegmentCountMismatch { video: 3, audio: 2 }
    ));
    assert!(harness.synth_calls().is_empty());
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 0);
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn synthesis_failure_stops_at_failing_index() {
    let synthesizer = StubSynthesizer {
        fail_at: Some(2),
        ..Default::default()
    };
    let harness = Harness::new(StubSegmenter::new(5, 5), synthesizer);
    let (video, audio) = harness.inputs("face").await;

    let run = PipelineRun::new(5.0, MediaAsset::video(&video), MediaAsset::audio(&audio));
    let outcome = harness.orchestrator().run(run).await;

    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.segment_index(), Some(2));
    assert!(err.to_string().contains("exited with status 1"));
    assert_eq!(harness.synth_calls(), vec![0, 1, 2]);
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 0);

    assert_eq!(outcome.run.stage, PipelineStage::Failed);
    assert_eq!(outcome.run.results.len(), 3);
    assert!(outcome.run.error_message.is_some());
    assert!(outcome.run.output_path.is_none());
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn segmentation_failure_is_reported_with_kind() {
    let segmenter = StubSegmenter {
        fail_kind: Some(MediaKind::Audio),
        ..StubSegmenter::new(3, 3)
    };
    let harness = Harness::new(segmenter, StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .convert(2.0, &video, &audio)
        .await
        .unwrap_err();

    match err {
        PipelineError::SegmentationFailed {
            kind, exit_code, ..
        } => {
            assert_eq!(kind, MediaKind::Audio);
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(harness.synth_calls().is_empty());
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn negative_segment_length_is_rejected() {
    let harness = Harness::new(StubSegmenter::new(1, 1), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .convert(-1.0, &video, &audio)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Config(_)));
    assert!(harness.synth_calls().is_empty());
}

#[tokio::test]
async fn cleanup_leaves_only_the_final_output() {
    let harness = Harness::new(StubSegmenter::new(3, 3), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let run = PipelineRun::new(5.0, MediaAsset::video(&video), MediaAsset::audio(&audio));
    let outcome = harness.orchestrator().run(run).await;

    assert!(outcome.is_success());
    assert!(outcome.cleanup_warnings.is_empty());
    assert!(harness.work_dir_is_empty().await);

    let mut entries = fs::read_dir(harness.output_dir()).await.unwrap();
    let mut outputs = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        outputs.push(entry.path());
    }
    assert_eq!(outputs, vec![outcome.run.output_path.clone().unwrap()]);
    assert_eq!(outcome.run.stage, PipelineStage::Done);
}

#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let harness = Harness::new(StubSegmenter::new(3, 3), StubSynthesizer::default());
    let (video_a, audio_a) = harness.inputs("alpha").await;
    let (video_b, audio_b) = harness.inputs("bravo").await;
    let orchestrator = harness.orchestrator();

    let (a, b) = tokio::join!(
        orchestrator.convert(1.0, &video_a, &audio_a),
        orchestrator.convert(1.0, &video_b, &audio_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a, b);
    assert_eq!(
        fs::read_to_string(&a).await.unwrap(),
        "alpha#0|alpha#1|alpha#2"
    );
    assert_eq!(
        fs::read_to_string(&b).await.unwrap(),
        "bravo#0|bravo#1|bravo#2"
    );
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn stage_sequence_is_deterministic() {
    let harness = Harness::new(StubSegmenter::new(2, 2), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;
    let (tx, mut rx) = progress_channel(0);

    harness
        .orchestrator()
        .with_progress(tx)
        .convert(5.0, &video, &audio)
        .await
        .unwrap();

    let events = rx.drain();
    assert_eq!(
        stages(&events),
        vec![
            PipelineStage::Segmenting,
            PipelineStage::Dispatching,
            PipelineStage::Synthesizing,
            PipelineStage::Reassembling,
            PipelineStage::CleaningUp,
            PipelineStage::Done,
        ]
    );

    let completed: Vec<(u32, Option<u8>)> = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SegmentCompleted { .. }))
        .map(|e| match e {
            ProgressEvent::SegmentCompleted { index, .. } => (*index, e.percent()),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(completed, vec![(0, Some(50)), (1, Some(100))]);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn failed_run_still_passes_through_cleanup() {
    let harness = Harness::new(StubSegmenter::new(2, 3), StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;
    let (tx, mut rx) = progress_channel(0);

    let _ = harness
        .orchestrator()
        .with_progress(tx)
        .convert(5.0, &video, &audio)
        .await;

    let events = rx.drain();
    assert_eq!(
        stages(&events),
        vec![
            PipelineStage::Segmenting,
            PipelineStage::Dispatching,
            PipelineStage::CleaningUp,
            PipelineStage::Failed,
        ]
    );
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Failed {
            stage: PipelineStage::Dispatching,
            ..
        })
    ));
}

#[tokio::test]
async fn parallel_synthesis_preserves_order() {
    let synthesizer = StubSynthesizer {
        stagger: true,
        ..Default::default()
    };
    let mut harness = Harness::new(StubSegmenter::new(6, 6), synthesizer);
    harness.parallelism = 3;
    let (video, audio) = harness.inputs("face").await;

    let run = PipelineRun::new(5.0, MediaAsset::video(&video), MediaAsset::audio(&audio));
    let outcome = harness.orchestrator().run(run).await;

    let output = outcome.result.as_ref().unwrap();
    let indices: Vec<u32> = outcome.run.results.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(
        fs::read_to_string(output).await.unwrap(),
        "face#0|face#1|face#2|face#3|face#4|face#5"
    );
    assert!(harness.synthesizer.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn cancellation_stops_the_run_and_cleans_up() {
    let synthesizer = StubSynthesizer {
        hang: true,
        ..Default::default()
    };
    let harness = Harness::new(StubSegmenter::new(3, 3), synthesizer);
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .with_cancel(cancel_after(Duration::from_millis(100)))
        .convert(5.0, &video, &audio)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: PipelineStage::Synthesizing
        }
    ));
    assert_eq!(harness.synth_calls(), vec![0]);
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 0);
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn reassembly_failure_removes_partial_output() {
    let reassembler = StubReassembler {
        fail: true,
        ..Default::default()
    };
    let harness = Harness::new(StubSegmenter::new(2, 2), StubSynthesizer::default())
        .with_reassembler(reassembler);
    let (video, audio) = harness.inputs("face").await;
    let (tx, mut rx) = progress_channel(0);

    let run = PipelineRun::new(5.0, MediaAsset::video(&video), MediaAsset::audio(&audio));
    let outcome = harness.orchestrator().with_progress(tx).run(run).await;

    match outcome.result.as_ref().unwrap_err() {
        PipelineError::ReassemblyFailed { exit_code, message } => {
            assert_eq!(*exit_code, Some(1));
            assert!(message.contains("Non-monotonous DTS"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.synth_calls(), vec![0, 1]);
    assert_eq!(
        stages(&rx.drain()),
        vec![
            PipelineStage::Segmenting,
            PipelineStage::Dispatching,
            PipelineStage::Synthesizing,
            PipelineStage::Reassembling,
            PipelineStage::CleaningUp,
            PipelineStage::Failed,
        ]
    );
    assert!(outcome.run.output_path.is_none());
    assert!(outcome.cleanup_warnings.is_empty());
    assert!(harness.output_dir_is_empty().await);
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn cancellation_during_reassembly_removes_partial_output() {
    let reassembler = StubReassembler {
        hang: true,
        ..Default::default()
    };
    let harness = Harness::new(StubSegmenter::new(2, 2), StubSynthesizer::default())
        .with_reassembler(reassembler);
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .with_cancel(cancel_after(Duration::from_millis(100)))
        .convert(5.0, &video, &audio)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: PipelineStage::Reassembling
        }
    ));
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 1);
    assert!(harness.output_dir_is_empty().await);
    assert!(harness.work_dir_is_empty().await);
}

#[tokio::test]
async fn cancellation_during_segmentation_skips_synthesis() {
    let segmenter = StubSegmenter {
        hang: true,
        ..StubSegmenter::new(3, 3)
    };
    let harness = Harness::new(segmenter, StubSynthesizer::default());
    let (video, audio) = harness.inputs("face").await;

    let err = harness
        .orchestrator()
        .with_cancel(cancel_after(Duration::from_millis(100)))
        .convert(5.0, &video, &audio)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: PipelineStage::Segmenting
        }
    ));
    assert!(harness.synth_calls().is_empty());
    assert_eq!(harness.reassembler.calls.load(Ordering::SeqCst), 0);
    assert!(harness.work_dir_is_empty().await);
}
