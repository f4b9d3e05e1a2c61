//! Pairing of video and audio segments by index.

use retalk_models::{SegmentPair, SegmentSequence};

use crate::error::{PipelineError, PipelineResult};

/// Zip two sequences into index-aligned pairs.
///
/// Unequal lengths are an error; the longer side is never truncated.
pub fn dispatch(
    video: &SegmentSequence,
    audio: &SegmentSequence,
) -> PipelineResult<Vec<SegmentPair>> {
    if video.len() != audio.len() {
        return Err(PipelineError::SegmentCountMismatch {
            video: video.len(),
            audio: audio.len(),
        });
    }

    Ok(video
        .iter()
        .zip(audio.iter())
        .enumerate()
        .map(|(index, (v, a))| SegmentPair::new(index as u32, v.clone(), a.clone()))
        .collect())
}
