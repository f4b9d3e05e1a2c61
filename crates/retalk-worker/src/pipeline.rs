//! Pipeline orchestrator: segment, pair, synthesize, reassemble, clean up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use retalk_media::{
    CleanupWarning, FfmpegReassembler, FfmpegSegmenter, MediaError, ProgressSender, Reassembler,
    Segmenter, Synthesizer, SystemInvoker, ToolInvoker, ToolSynthesizer, Workspace,
};
use retalk_models::{
    FailureReason, MediaAsset, PipelineRun, PipelineStage, SegmentPair,
    SegmentSequence, SynthesisResult,
};
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

use crate::config::WorkerConfig;
use crate::dispatcher::dispatch;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::RunLogger;
use crate::metrics;

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Final state of the run, including per-segment results
    pub run: PipelineRun,
    /// Final output path, or the error that ended the run
    pub result: PipelineResult<PathBuf>,
    /// Files cleanup could not remove
    pub cleanup_warnings: Vec<CleanupWarning>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> PipelineResult<PathBuf> {
        self.result
    }
}

/// Drives one run at a time through the stage machine.
///
/// Collaborators sit behind traits; [`PipelineOrchestrator::from_config`]
/// wires the ffmpeg and subprocess-backed implementations.
pub struct PipelineOrchestrator {
    config: WorkerConfig,
    segmenter: Arc<dyn Segmenter>,
    synthesizer: Arc<dyn Synthesizer>,
    reassembler: Arc<dyn Reassembler>,
    progress: Option<ProgressSender>,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: WorkerConfig,
        segmenter: Arc<dyn Segmenter>,
        synthesizer: Arc<dyn Synthesizer>,
        reassembler: Arc<dyn Reassembler>,
    ) -> Self {
        Self {
            config,
            segmenter,
            synthesizer,
            reassembler,
            progress: None,
            cancel_rx: None,
        }
    }

    /// Build an orchestrator that runs the real external tools.
    pub fn from_config(config: WorkerConfig) -> PipelineResult<Self> {
        config.validate()?;

        let invoker: Arc<dyn ToolInvoker> = Arc::new(SystemInvoker);
        let segmenter = FfmpegSegmenter::new(Arc::clone(&invoker))
            .with_ffmpeg(&config.ffmpeg)
            .with_passthrough(config.passthrough);
        let synthesizer = ToolSynthesizer::new(Arc::clone(&invoker), config.synthesis.clone())
            .with_timeout(config.synthesis_timeout);
        let reassembler = FfmpegReassembler::new(invoker).with_ffmpeg(&config.ffmpeg);

        Ok(Self::new(
            config,
            Arc::new(segmenter),
            Arc::new(synthesizer),
            Arc::new(reassembler),
        ))
    }

    /// Emit progress events on `sender`.
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Abort runs when `cancel_rx` flips to `true`.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// Convert `video` so its lips follow `audio`, returning the output path.
    ///
    /// `segment_seconds == 0` processes the inputs whole.
    pub async fn convert(
        &self,
        segment_seconds: f64,
        video: impl AsRef<Path>,
        audio: impl AsRef<Path>,
    ) -> PipelineResult<PathBuf> {
        let run = PipelineRun::new(
            segment_seconds,
            MediaAsset::video(video.as_ref()),
            MediaAsset::audio(audio.as_ref()),
        );
        self.run(run).await.into_result()
    }

    /// Execute `run` to completion. Cleanup always happens, whatever the
    /// outcome.
    pub async fn run(&self, run: PipelineRun) -> PipelineOutcome {
        let logger = RunLogger::new(&run.id, "convert");
        let span = logger.create_span();
        self.execute(run, logger).instrument(span).await
    }

    async fn execute(&self, mut run: PipelineRun, logger: RunLogger) -> PipelineOutcome {
        let started = Instant::now();
        metrics::record_run_started(run.is_segmented());
        logger.log_start(&format!(
            "video={} audio={} segment_seconds={}",
            run.input_video.path().display(),
            run.input_audio.path().display(),
            run.segment_seconds
        ));

        let workspace = Workspace::new(&self.config.work_dir, &run.id);
        let destination = self.output_path(&run);
        let result = self.drive(&mut run, &workspace, &destination).await;
        let last_stage = run.stage;

        self.transition(&mut run, PipelineStage::CleaningUp);
        let mut cleanup_warnings = workspace.teardown().await;
        if result.is_err() {
            // A failed or killed concat can leave a truncated output behind.
            cleanup_warnings.extend(workspace.cleanup(&[destination]).await);
        }
        for warning in &cleanup_warnings {
            logger.log_warning(&warning.to_string());
        }
        metrics::record_cleanup_warnings(cleanup_warnings.len());

        match &result {
            Ok(path) => {
                run.complete(path);
                self.transition(&mut run, PipelineStage::Done);
                if let Some(progress) = &self.progress {
                    progress.completed(&run.id, path);
                }
                metrics::record_run_completed(started.elapsed().as_secs_f64());
                logger.log_completion(&format!(
                    "{} in {:.1}s",
                    path.display(),
                    started.elapsed().as_secs_f64()
                ));
            }
            Err(e) => {
                let stage = e.stage().unwrap_or(last_stage);
                run.fail(e.to_string());
                self.transition(&mut run, PipelineStage::Failed);
                if let Some(progress) = &self.progress {
                    progress.failed(&run.id, stage, e.to_string());
                }
                metrics::record_run_failed(stage.as_str());
                logger.log_error(&format!("{} failed: {}", stage, e));
            }
        }

        PipelineOutcome {
            run,
            result,
            cleanup_warnings,
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        workspace: &Workspace,
        destination: &Path,
    ) -> PipelineResult<PathBuf> {
        self.transition(run, PipelineStage::Segmenting);
        let (video, audio) = self.segment(run, workspace).await?;
        run.video_segments = Some(video.clone());
        run.audio_segments = Some(audio.clone());

        self.transition(run, PipelineStage::Dispatching);
        let pairs = dispatch(&video, &audio)?;
        info!(pairs = pairs.len(), "Segments paired");
        if let Some(progress) = &self.progress {
            progress.segments_ready(&run.id, pairs.len() as u32);
        }
        self.check_cancelled(PipelineStage::Dispatching)?;

        self.transition(run, PipelineStage::Synthesizing);
        self.synthesize_all(run, workspace, &pairs).await?;
        self.check_cancelled(PipelineStage::Synthesizing)?;

        self.transition(run, PipelineStage::Reassembling);
        self.reassembler
            .concatenate(workspace, &run.results, destination, self.cancel_rx.clone())
            .await
            .map_err(PipelineError::reassembly)
    }

    async fn segment(
        &self,
        run: &PipelineRun,
        workspace: &Workspace,
    ) -> PipelineResult<(SegmentSequence, SegmentSequence)> {
        let seconds = run.segment_seconds;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(PipelineError::config(format!(
                "segment length must be zero or positive, got {}",
                seconds
            )));
        }

        let video = &run.input_video;
        let audio = &run.input_audio;

        if run.is_segmented() {
            tokio::try_join!(
                self.split_one(workspace, video, seconds),
                self.split_one(workspace, audio, seconds)
            )
        } else {
            info!("Segmentation disabled, passing inputs through");
            tokio::try_join!(
                self.place_one(workspace, video),
                self.place_one(workspace, audio)
            )
        }
    }

    async fn split_one(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
        seconds: f64,
    ) -> PipelineResult<SegmentSequence> {
        self.segmenter
            .split(workspace, asset, seconds, self.cancel_rx.clone())
            .await
            .map_err(|e| PipelineError::segmentation(asset.kind, e))
    }

    async fn place_one(
        &self,
        workspace: &Workspace,
        asset: &MediaAsset,
    ) -> PipelineResult<SegmentSequence> {
        self.segmenter
            .passthrough(workspace, asset)
            .await
            .map_err(|e| PipelineError::segmentation(asset.kind, e))
    }

    /// Synthesize every pair, recording results on `run` in index order.
    /// Stops scheduling at the first failure.
    async fn synthesize_all(
        &self,
        run: &mut PipelineRun,
        workspace: &Workspace,
        pairs: &[SegmentPair],
    ) -> PipelineResult<()> {
        let total = pairs.len() as u32;
        let parallelism = self.config.synthesis_parallelism.max(1);
        let run_id = run.id.clone();

        let tasks = pairs.iter().map(|pair| {
            let output = workspace.result_path(pair.index);
            let cancel = self.cancel_rx.clone();
            let run_id = run_id.clone();
            async move {
                if is_cancelled(&cancel) {
                    let skipped =
                        SynthesisResult::failed(pair.index, output, FailureReason::Cancelled);
                    return (pair.index, Ok(skipped), Duration::ZERO);
                }
                if let Some(progress) = &self.progress {
                    progress.segment_started(&run_id, pair.index, total);
                }
                let started = Instant::now();
                let result = self.synthesizer.synthesize(pair, &output, cancel).await;
                (pair.index, result, started.elapsed())
            }
            .instrument(info_span!("segment", index = pair.index))
        });

        // Completions arrive in index order regardless of parallelism.
        let stream = futures::stream::iter(tasks).buffered(parallelism);
        let mut stream = std::pin::pin!(stream);

        while let Some((index, result, elapsed)) = stream.next().await {
            let result = result.map_err(|e| match e {
                MediaError::Cancelled => PipelineError::Cancelled {
                    stage: PipelineStage::Synthesizing,
                },
                other => PipelineError::synthesis(index, other.to_string()),
            })?;

            if let Some(reason) = result.failure_reason() {
                if *reason == FailureReason::Cancelled {
                    return Err(PipelineError::Cancelled {
                        stage: PipelineStage::Synthesizing,
                    });
                }
                metrics::record_segment_synthesized(false, elapsed.as_secs_f64());
                let reason = reason.to_string();
                error!(segment = index, "Synthesis failed: {}", reason);
                let _ = run.record_result(result);
                return Err(PipelineError::synthesis(index, reason));
            }

            metrics::record_segment_synthesized(true, elapsed.as_secs_f64());
            run.record_result(result).map_err(|r| {
                PipelineError::synthesis(r.index, "result arrived out of order")
            })?;
            info!(segment = index, total, "Segment synthesized");
            if let Some(progress) = &self.progress {
                progress.segment_completed(&run_id, index, total);
            }
        }

        Ok(())
    }

    /// Final file for `run`; the only thing a successful run leaves behind.
    fn output_path(&self, run: &PipelineRun) -> PathBuf {
        self.config.output_dir.join(format!("output_{}.mp4", run.id))
    }

    fn transition(&self, run: &mut PipelineRun, stage: PipelineStage) {
        if let Err(e) = run.advance(stage) {
            error!("{}", e);
            return;
        }
        info!(stage = stage.as_str(), "Stage changed");
        if let Some(progress) = &self.progress {
            progress.stage_changed(&run.id, stage);
        }
    }

    fn check_cancelled(&self, stage: PipelineStage) -> PipelineResult<()> {
        if is_cancelled(&self.cancel_rx) {
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }
}

fn is_cancelled(cancel_rx: &Option<watch::Receiver<bool>>) -> bool {
    cancel_rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}
