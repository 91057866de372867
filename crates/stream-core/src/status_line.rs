//! Embedded status line decoding and continuity checks.
//!
//! Cameras with a status line overwrite the last row of every frame with a
//! small record. The low byte of the first four pixels holds the marker
//! `0x55AA00FF` (little-endian), the low byte of the next four holds the
//! hardware frame counter. Only the lower 24 bits of the counter are
//! meaningful; it wraps around at `2^24`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::Frame;
use crate::error::StreamError;

/// Marker identifying a status line.
pub const STATUS_LINE_MARKER: u32 = 0x55AA_00FF;

/// Width of the hardware counter in bits.
pub const COUNTER_BITS: u32 = 24;

const COUNTER_MODULUS: u64 = 1 << COUNTER_BITS;
const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;
const STATUS_LINE_PIXELS: u32 = 8;

fn low_byte_word(frame: &Frame, row: u32, start: u32) -> Option<u32> {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (frame.get_int(start + i as u32, row)? & 0xFF) as u8;
    }
    Some(u32::from_le_bytes(bytes))
}

/// Decode the hardware counter from the status line of `frame`.
///
/// Returns `None` if the frame is too narrow or the marker is missing.
pub fn read_status_counter(frame: &Frame) -> Option<u32> {
    if frame.width < STATUS_LINE_PIXELS || frame.height == 0 {
        return None;
    }
    let row = frame.height - 1;
    if low_byte_word(frame, row, 0)? != STATUS_LINE_MARKER {
        return None;
    }
    Some(low_byte_word(frame, row, 4)? & COUNTER_MASK)
}

/// Encode `counter` into the status line of a frame given as `u16` pixels.
///
/// `pixels` is the row-major buffer of a `width`-wide frame. Frames narrower
/// than eight pixels are left untouched.
pub fn write_status_line(pixels: &mut [u16], width: u32, counter: u32) {
    let width = width as usize;
    if width < STATUS_LINE_PIXELS as usize || pixels.len() < width {
        return;
    }
    let row_start = pixels.len() - pixels.len() % width - width;
    let marker = STATUS_LINE_MARKER.to_le_bytes();
    let count = (counter & COUNTER_MASK).to_le_bytes();
    for (px, b) in pixels[row_start..row_start + 8]
        .iter_mut()
        .zip(marker.iter().chain(count.iter()))
    {
        *px = u16::from(*b);
    }
}

/// Session-level result of the status line check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatusLineCheck {
    /// Checking disabled for this session
    #[default]
    Off,
    /// Enabled, but nothing checked yet
    #[serde(rename = "na")]
    NotAvailable,
    /// All checked frames were consecutive
    Ok,
    /// A counter went backwards or advanced by less than the step
    OutOfOrder,
    /// The same frame was delivered twice
    Still,
    /// Frames were skipped
    Skip,
    /// Frames carry no status line
    #[serde(rename = "none")]
    NoStatusLine,
}

impl StatusLineCheck {
    /// Whether the check should still be evaluated.
    ///
    /// Once a problem was seen it sticks for the rest of the session.
    pub fn is_pending(self) -> bool {
        matches!(self, StatusLineCheck::Ok | StatusLineCheck::NotAvailable)
    }

    /// Whether this state indicates a continuity problem.
    pub fn is_anomaly(self) -> bool {
        matches!(
            self,
            StatusLineCheck::OutOfOrder | StatusLineCheck::Still | StatusLineCheck::Skip
        )
    }

    /// Short tag used in status output and settings files.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLineCheck::Off => "off",
            StatusLineCheck::NotAvailable => "na",
            StatusLineCheck::Ok => "ok",
            StatusLineCheck::OutOfOrder => "out_of_order",
            StatusLineCheck::Still => "still",
            StatusLineCheck::Skip => "skip",
            StatusLineCheck::NoStatusLine => "none",
        }
    }
}

impl fmt::Display for StatusLineCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusLineCheck {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(StatusLineCheck::Off),
            "na" => Ok(StatusLineCheck::NotAvailable),
            "ok" => Ok(StatusLineCheck::Ok),
            "out_of_order" => Ok(StatusLineCheck::OutOfOrder),
            "still" => Ok(StatusLineCheck::Still),
            "skip" => Ok(StatusLineCheck::Skip),
            "none" => Ok(StatusLineCheck::NoStatusLine),
            other => Err(StreamError::Configuration(format!(
                "unknown status line check '{}'",
                other
            ))),
        }
    }
}

/// Checks hardware counters across the frames of one session.
///
/// The only state kept between calls is the counter of the last frame that
/// passed the check.
#[derive(Debug, Default, Clone)]
pub struct StatusLineVerifier {
    last_counter: Option<u32>,
}

impl StatusLineVerifier {
    /// Create a verifier with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last seen counter (new session).
    pub fn reset(&mut self) {
        self.last_counter = None;
    }

    /// Counter of the last frame that passed the check.
    pub fn last_counter(&self) -> Option<u32> {
        self.last_counter
    }

    /// Check `frames` against each other and against the previous call.
    ///
    /// `step` is the expected counter increment between frames.
    pub fn check<'a, I>(&mut self, frames: I, step: u64) -> StatusLineCheck
    where
        I: IntoIterator<Item = &'a Frame>,
    {
        let step = step.max(1);
        for frame in frames {
            let Some(counter) = read_status_counter(frame) else {
                return StatusLineCheck::NoStatusLine;
            };
            if let Some(last) = self.last_counter {
                let df = (u64::from(counter) + COUNTER_MODULUS - u64::from(last)) % COUNTER_MODULUS;
                if df > COUNTER_MODULUS / 2 || (df > 0 && df < step) {
                    return StatusLineCheck::OutOfOrder;
                }
                if df == 0 {
                    return StatusLineCheck::Still;
                }
                if df > step {
                    return StatusLineCheck::Skip;
                }
            }
            self.last_counter = Some(counter);
        }
        StatusLineCheck::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_counter(counter: u32) -> Frame {
        let mut px = vec![1000u16; 16 * 4];
        write_status_line(&mut px, 16, counter);
        Frame::from_u16(16, 4, &px).unwrap()
    }

    #[test]
    fn test_counter_roundtrip() {
        let f = frame_with_counter(0x00AB_CDEF);
        assert_eq!(read_status_counter(&f), Some(0x00AB_CDEF));
    }

    #[test]
    fn test_counter_masked_to_24_bits() {
        let f = frame_with_counter(0xFF00_0001);
        assert_eq!(read_status_counter(&f), Some(1));
    }

    #[test]
    fn test_missing_marker() {
        let f = Frame::from_u16(16, 4, &[0u16; 64]).unwrap();
        assert_eq!(read_status_counter(&f), None);
        let narrow = Frame::from_u16(4, 4, &[0u16; 16]).unwrap();
        assert_eq!(read_status_counter(&narrow), None);
    }

    #[test]
    fn test_consecutive_frames_ok() {
        let frames: Vec<_> = (5..10).map(frame_with_counter).collect();
        let mut v = StatusLineVerifier::new();
        assert_eq!(v.check(&frames, 1), StatusLineCheck::Ok);
        assert_eq!(v.last_counter(), Some(9));
        let more: Vec<_> = (10..12).map(frame_with_counter).collect();
        assert_eq!(v.check(&more, 1), StatusLineCheck::Ok);
    }

    #[test]
    fn test_wraparound_is_ok() {
        let frames = vec![frame_with_counter(COUNTER_MASK), frame_with_counter(0)];
        let mut v = StatusLineVerifier::new();
        assert_eq!(v.check(&frames, 1), StatusLineCheck::Ok);
    }

    #[test]
    fn test_anomalies() {
        let mut v = StatusLineVerifier::new();
        let still = vec![frame_with_counter(3), frame_with_counter(3)];
        assert_eq!(v.check(&still, 1), StatusLineCheck::Still);

        let mut v = StatusLineVerifier::new();
        let back = vec![frame_with_counter(10), frame_with_counter(9)];
        assert_eq!(v.check(&back, 1), StatusLineCheck::OutOfOrder);

        let mut v = StatusLineVerifier::new();
        let skip = vec![frame_with_counter(10), frame_with_counter(13)];
        assert_eq!(v.check(&skip, 1), StatusLineCheck::Skip);

        let mut v = StatusLineVerifier::new();
        let short_step = vec![frame_with_counter(10), frame_with_counter(11)];
        assert_eq!(v.check(&short_step, 2), StatusLineCheck::OutOfOrder);
    }

    #[test]
    fn test_no_status_line() {
        let f = Frame::from_u16(16, 4, &[7u16; 64]).unwrap();
        let mut v = StatusLineVerifier::new();
        assert_eq!(v.check([&f], 1), StatusLineCheck::NoStatusLine);
    }

    #[test]
    fn test_pending_and_tags() {
        assert!(StatusLineCheck::NotAvailable.is_pending());
        assert!(StatusLineCheck::Ok.is_pending());
        assert!(!StatusLineCheck::Skip.is_pending());
        assert!(StatusLineCheck::Still.is_anomaly());
        assert_eq!("none".parse::<StatusLineCheck>().unwrap(), StatusLineCheck::NoStatusLine);
        assert_eq!(StatusLineCheck::NotAvailable.to_string(), "na");
        assert!("bogus".parse::<StatusLineCheck>().is_err());
    }
}
