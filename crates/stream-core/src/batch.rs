//! Frame batches as delivered by the capture source.
//!
//! A [`FrameBatch`] is a contiguous run of same-shaped frames plus the metadata
//! the saver needs for accounting: the hardware index of the first frame, the
//! index step between frames, the capture session id and the creation time.
//!
//! Indices are assigned by the capture source. `first_index == 0` marks a
//! (re)started stream; so does a change of `session_id`. Gap accounting never
//! counts frames across such a reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Frame;
use crate::error::{StreamError, StreamResult};

/// Per-frame auxiliary values (exposure, hardware timestamp, ...).
///
/// `rows` is aligned with the frames of the owning batch; a `None` row means
/// the capture source had nothing to report for that frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Column names, without the leading save index column
    pub fields: Vec<String>,
    /// One optional row per frame
    pub rows: Vec<Option<Vec<f64>>>,
}

/// Index and capture session of the last frame observed by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePosition {
    /// Hardware index of the frame
    pub index: u64,
    /// Capture session the frame belongs to
    pub session_id: u64,
}

/// Accounting metadata of a batch, without its pixel data.
///
/// Lets a batch be counted as dropped after its frames were released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// Hardware index of the first frame
    pub first_index: u64,
    /// Index increment between consecutive frames
    pub step: u64,
    /// Capture session id
    pub session_id: u64,
    /// Number of frames
    pub len: u64,
}

impl BatchHeader {
    /// Keep at most `size` frames, oldest first.
    pub fn truncate(&mut self, size: u64) {
        self.len = self.len.min(size);
    }

    /// Position of the last frame.
    pub fn last_position(&self) -> FramePosition {
        FramePosition {
            index: self.first_index + self.len.saturating_sub(1) * self.step,
            session_id: self.session_id,
        }
    }

    /// Whether this batch starts a new stream relative to `previous`.
    ///
    /// A zero first index is always a reset; a change of session id is one too.
    pub fn is_reset_after(&self, previous: Option<FramePosition>) -> bool {
        if self.first_index == 0 {
            return true;
        }
        match previous {
            Some(prev) => prev.session_id != self.session_id,
            None => false,
        }
    }

    /// Number of frames skipped between `previous` and the start of this batch.
    ///
    /// Zero when there is no previous frame, across a reset, or when the index
    /// did not advance.
    pub fn missing_since(&self, previous: Option<FramePosition>) -> u64 {
        let Some(prev) = previous else {
            return 0;
        };
        if self.is_reset_after(previous) || self.first_index <= prev.index {
            return 0;
        }
        ((self.first_index - prev.index) / self.step).saturating_sub(1)
    }
}

/// A batch of one or more frames captured contiguously.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    frames: Vec<Frame>,
    first_index: u64,
    step: u64,
    session_id: u64,
    creation_time: DateTime<Utc>,
    status_line: bool,
    frame_info: Option<FrameInfo>,
}

impl FrameBatch {
    /// Create a batch starting at hardware index `first_index`.
    ///
    /// The batch must hold at least one frame. Defaults: step 1, session 0,
    /// creation time now, no status line, no frame info.
    pub fn new(frames: Vec<Frame>, first_index: u64) -> StreamResult<Self> {
        if frames.is_empty() {
            return Err(StreamError::Configuration(
                "frame batch must contain at least one frame".to_string(),
            ));
        }
        Ok(Self {
            frames,
            first_index,
            step: 1,
            session_id: 0,
            creation_time: Utc::now(),
            status_line: false,
            frame_info: None,
        })
    }

    /// Set the capture session id.
    pub fn with_session_id(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    /// Set the index step between consecutive frames (minimum 1).
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step.max(1);
        self
    }

    /// Set the capture timestamp.
    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self
    }

    /// Mark the frames as carrying an embedded status line.
    pub fn with_status_line(mut self, status_line: bool) -> Self {
        self.status_line = status_line;
        self
    }

    /// Attach per-frame auxiliary rows.
    ///
    /// Rows beyond the number of frames are dropped; missing rows are `None`.
    pub fn with_frame_info(mut self, mut info: FrameInfo) -> Self {
        if info.rows.len() != self.frames.len() {
            tracing::warn!(
                rows = info.rows.len(),
                frames = self.frames.len(),
                "frame info row count does not match frame count"
            );
            info.rows.resize(self.frames.len(), None);
        }
        self.frame_info = Some(info);
        self
    }

    /// Frames in capture order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the batch was truncated down to nothing.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Hardware index of the first frame.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Hardware index of the last frame.
    pub fn last_index(&self) -> u64 {
        let n = self.frames.len().max(1) as u64;
        self.first_index + (n - 1) * self.step
    }

    /// Index increment between consecutive frames.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Capture session id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Capture timestamp.
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// Whether frames carry an embedded status line.
    pub fn has_status_line(&self) -> bool {
        self.status_line
    }

    /// Per-frame auxiliary rows, if any.
    pub fn frame_info(&self) -> Option<&FrameInfo> {
        self.frame_info.as_ref()
    }

    /// Total pixel data size in bytes.
    pub fn nbytes(&self) -> u64 {
        self.frames.iter().map(|f| f.nbytes() as u64).sum()
    }

    /// Accounting metadata of this batch.
    pub fn header(&self) -> BatchHeader {
        BatchHeader {
            first_index: self.first_index,
            step: self.step,
            session_id: self.session_id,
            len: self.frames.len() as u64,
        }
    }

    /// Position of the last frame.
    pub fn last_position(&self) -> FramePosition {
        self.header().last_position()
    }

    /// Whether this batch starts a new stream relative to `previous`.
    pub fn is_reset_after(&self, previous: Option<FramePosition>) -> bool {
        self.header().is_reset_after(previous)
    }

    /// Number of frames skipped between `previous` and the start of this batch.
    pub fn missing_since(&self, previous: Option<FramePosition>) -> u64 {
        self.header().missing_since(previous)
    }

    /// Keep at most `size` frames.
    ///
    /// With `from_end` the newest frames are kept and the first index moves
    /// forward accordingly; otherwise the oldest frames are kept.
    pub fn cut_to_size(&mut self, size: usize, from_end: bool) {
        let len = self.frames.len();
        if size >= len {
            return;
        }
        let removed = len - size;
        if from_end {
            self.frames.drain(..removed);
            if let Some(info) = self.frame_info.as_mut() {
                info.rows.drain(..removed.min(info.rows.len()));
            }
            self.first_index += removed as u64 * self.step;
        } else {
            self.frames.truncate(size);
            if let Some(info) = self.frame_info.as_mut() {
                info.rows.truncate(size);
            }
        }
    }
}
