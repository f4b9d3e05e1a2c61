//! Media assets and segment sequences.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Kind of media stream an asset carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Face video driving the synthesis
    Video,
    /// Target audio track
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    /// Extension used for segments when the source file has none.
    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Video => "mp4",
            MediaKind::Audio => "wav",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reference to a media file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MediaAsset {
    /// Location of the file
    pub path: PathBuf,
    /// Stream kind
    pub kind: MediaKind,
    /// Segment index, absent for unsegmented assets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl MediaAsset {
    /// Create an unsegmented asset (as supplied by a caller).
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            path: path.into(),
            kind,
            index: None,
        }
    }

    /// Create a segment asset carrying its index.
    pub fn segment(path: impl Into<PathBuf>, kind: MediaKind, index: u32) -> Self {
        Self {
            path: path.into(),
            kind,
            index: Some(index),
        }
    }

    pub fn video(path: impl Into<PathBuf>) -> Self {
        Self::new(path, MediaKind::Video)
    }

    pub fn audio(path: impl Into<PathBuf>) -> Self {
        Self::new(path, MediaKind::Audio)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File extension of the asset, falling back to the kind's default.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| self.kind.default_extension().to_string())
    }
}

/// Reasons a list of assets cannot form a [`SegmentSequence`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("segment sequence is empty")]
    Empty,

    #[error("segment {index} is {found} but the sequence holds {expected} segments")]
    MixedKinds {
        index: usize,
        expected: MediaKind,
        found: MediaKind,
    },

    #[error("expected segment index {expected} at position {expected}, found {found:?}")]
    NonContiguous { expected: u32, found: Option<u32> },
}

/// Ordered, gap-free run of segments of one kind.
///
/// Indices are `0..N-1` and match positions; `N >= 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "Vec<MediaAsset>", into = "Vec<MediaAsset>")]
pub struct SegmentSequence {
    kind: MediaKind,
    segments: Vec<MediaAsset>,
}

impl SegmentSequence {
    /// Build a sequence, validating kind uniformity and index contiguity.
    pub fn new(segments: Vec<MediaAsset>) -> Result<Self, SequenceError> {
        let kind = segments.first().ok_or(SequenceError::Empty)?.kind;

        for (position, asset) in segments.iter().enumerate() {
            if asset.kind != kind {
                return Err(SequenceError::MixedKinds {
                    index: position,
                    expected: kind,
                    found: asset.kind,
                });
            }
            let expected = position as u32;
            if asset.index != Some(expected) {
                return Err(SequenceError::NonContiguous {
                    expected,
                    found: asset.index,
                });
            }
        }

        Ok(Self { kind, segments })
    }

    /// One-element sequence for the pass-through path.
    pub fn single(path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            kind,
            segments: vec![MediaAsset::segment(path, kind, 0)],
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false; kept for API symmetry with slices.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaAsset> {
        self.segments.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MediaAsset> {
        self.segments.iter()
    }

}

impl TryFrom<Vec<MediaAsset>> for SegmentSequence {
    type Error = SequenceError;

    fn try_from(segments: Vec<MediaAsset>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<SegmentSequence> for Vec<MediaAsset> {
    fn from(sequence: SegmentSequence) -> Self {
        sequence.segments
    }
}

impl<'a> IntoIterator for &'a SegmentSequence {
    type Item = &'a MediaAsset;
    type IntoIter = std::slice::Iter<'a, MediaAsset>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Aligned (video, audio) segments sharing one index; the unit of synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentPair {
    pub index: u32,
    pub video: MediaAsset,
    pub audio: MediaAsset,
}

impl SegmentPair {
    pub fn new(index: u32, video: MediaAsset, audio: MediaAsset) -> Self {
        Self {
            index,
            video,
            audio,
        }
    }
}
