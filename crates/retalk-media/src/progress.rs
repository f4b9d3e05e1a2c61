//! Progress reporting for pipeline runs.
//!
//! Events are pushed through a bounded channel so the pipeline never blocks
//! on a slow consumer. When the channel is full, events are dropped.

use std::path::Path;

use retalk_models::{PipelineStage, ProgressEvent, RunId};
use tokio::sync::mpsc;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Progress sender for async contexts.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Send a progress event (non-blocking).
    pub fn send(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }

    pub fn stage_changed(&self, run_id: &RunId, stage: PipelineStage) {
        self.send(ProgressEvent::StageChanged {
            run_id: run_id.clone(),
            stage,
        });
    }

    pub fn segments_ready(&self, run_id: &RunId, count: u32) {
        self.send(ProgressEvent::SegmentsReady {
            run_id: run_id.clone(),
            count,
        });
    }

    pub fn segment_started(&self, run_id: &RunId, index: u32, total: u32) {
        self.send(ProgressEvent::SegmentStarted {
            run_id: run_id.clone(),
            index,
            total,
        });
    }

    pub fn segment_completed(&self, run_id: &RunId, index: u32, total: u32) {
        self.send(ProgressEvent::SegmentCompleted {
            run_id: run_id.clone(),
            index,
            total,
        });
    }

    pub fn completed(&self, run_id: &RunId, output_path: &Path) {
        self.send(ProgressEvent::Completed {
            run_id: run_id.clone(),
            output_path: output_path.to_path_buf(),
        });
    }

    pub fn failed(&self, run_id: &RunId, stage: PipelineStage, error: impl Into<String>) {
        self.send(ProgressEvent::Failed {
            run_id: run_id.clone(),
            stage,
            error: error.into(),
        });
    }
}

/// Progress receiver for collecting events.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Receive the next progress event.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Try to receive a progress event without blocking.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain every event currently buffered.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a progress channel pair. A capacity of 0 uses the default.
pub fn channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let capacity = if capacity == 0 {
        DEFAULT_CAPACITY
    } else {
        capacity
    };
    let (tx, rx) = mpsc::channel(capacity);
    (ProgressSender::new(tx), ProgressReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let run_id = RunId::from_string("run-1");
        let (sender, mut receiver) = channel(0);

        sender.stage_changed(&run_id, PipelineStage::Synthesizing);
        sender.segment_started(&run_id, 0, 2);
        sender.segment_completed(&run_id, 0, 2);

        let event = receiver.recv().await.unwrap();
        assert!(matches!(
            event,
            ProgressEvent::StageChanged {
                stage: PipelineStage::Synthesizing,
                ..
            }
        ));

        let rest = receiver.drain();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].percent(), Some(50));
        assert_eq!(rest[1].run_id(), &run_id);
    }

    #[test]
    fn test_full_channel_drops_events() {
        let run_id = RunId::from_string("run-2");
        let (sender, mut receiver) = channel(1);

        sender.segments_ready(&run_id, 3);
        sender.segments_ready(&run_id, 4);

        assert_eq!(receiver.drain().len(), 1);
    }
}
