//! Tapes referenced by a video and where they appear on its timeline.

use serde::{Deserialize, Serialize};

use reelout_common::{Clock, Fps};

use crate::bitmap::Resolution;

/// Stretch of tape time the footage covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvailableRange {
    pub start: Clock,
    pub duration: Clock,
}

/// A piece of source footage referenced by the video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tape {
    /// File or directory name shown in timelines.
    pub name: String,
    /// Native frame rate, when the footage has one.
    pub fps: Option<Fps>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub available_range: Option<AvailableRange>,
}

impl Tape {
    pub fn new(name: impl Into<String>, fps: Option<Fps>) -> Self {
        Self {
            name: name.into(),
            fps,
            resolution: None,
            available_range: None,
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_available_range(mut self, start: Clock, duration: Clock) -> Self {
        self.available_range = Some(AvailableRange { start, duration });
        self
    }
}

/// A contiguous run of video frames that shows one tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeSpan {
    pub tape: Tape,
    /// First video frame (inclusive).
    pub first_frame_idx: u64,
    /// Last video frame (inclusive).
    pub last_frame_idx: u64,
    /// Tape time read at the first frame.
    pub first_read_timecode: Clock,
}

impl TapeSpan {
    pub fn duration_frames(&self) -> u64 {
        self.last_frame_idx - self.first_frame_idx + 1
    }
}
