//! Error types shared by the framestream crates.
//!
//! `StreamError` is the single error type returned across crate boundaries.
//! It only covers failures that are reported synchronously to a caller:
//! configuration problems detected at `SaveStart`, I/O on the control path,
//! and a closed saver service. Per-batch anomalies (RAM drops, index gaps,
//! status-line problems) are never errors; they are folded into counters.
//!
//! [`FrameWriteError`] is the one error that flows from a disk writer into the
//! session controller. It carries the exact number of frames of the failing
//! write call that reached the disk, so the controller can reconcile its
//! `saved` counter before force-stopping the session.

use thiserror::Error;

/// Convenience alias for results using [`StreamError`].
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Primary error type for the frame streaming pipeline.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The save path cannot be used (empty, a directory where a file is
    /// expected, or its parent directory cannot be created).
    ///
    /// Reported by `SaveStart`; the session does not transition to `Saving`.
    #[error("Invalid save path '{path}': {reason}")]
    InvalidPath {
        /// The offending path as given by the caller
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// A format tag that is not one of `raw`, `cam`, `tiff`, `bigtiff`.
    #[error("Unknown save format '{0}' (expected raw, cam, tiff or bigtiff)")]
    UnknownFormat(String),

    /// A path kind tag that is not one of `pfx`, `folder`.
    #[error("Unknown path kind '{0}' (expected pfx or folder)")]
    UnknownPathKind(String),

    /// Option values that parse but make no sense (zero file split, zero
    /// pretrigger size with pretrigger enabled, ...).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O on the control path (settings snapshot, path cleanup, event log).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame write failed part-way.
    #[error(transparent)]
    FrameWrite(#[from] FrameWriteError),

    /// The saver actor is gone; the handle can no longer deliver commands.
    #[error("Frame saver service is not running")]
    ServiceClosed,

    /// A wait on the saver state did not complete in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Frame saving error.
///
/// `saved` counts the frames of the failing call that were flushed to disk
/// before the failure; frames after that point must be treated as lost.
#[derive(Error, Debug)]
#[error("error saving frames: only {saved} frames saved")]
pub struct FrameWriteError {
    /// Frames durably written by the failing call
    pub saved: u64,
    /// Underlying cause
    #[source]
    pub source: anyhow::Error,
}

impl FrameWriteError {
    /// Create a write error after `saved` frames reached the disk.
    pub fn new(saved: u64, source: impl Into<anyhow::Error>) -> Self {
        Self {
            saved,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_write_error_reports_count() {
        let err = FrameWriteError::new(
            7,
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.saved, 7);
        assert!(err.to_string().contains("only 7 frames saved"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_stream_error_from_write_error() {
        let err: StreamError = FrameWriteError::new(0, anyhow::anyhow!("boom")).into();
        assert!(matches!(err, StreamError::FrameWrite(ref e) if e.saved == 0));
    }

    #[test]
    fn test_invalid_path_message() {
        let err = StreamError::InvalidPath {
            path: "".to_string(),
            reason: "path is empty".to_string(),
        };
        assert!(err.to_string().contains("path is empty"));
    }
}
