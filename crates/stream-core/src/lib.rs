//! `stream-core`
//!
//! Shared data model for the framestream pipeline.
//!
//! ## Key Types
//!
//! - [`Frame`]: a single 2D image backed by a shared byte buffer
//! - [`FrameBatch`]: frames captured contiguously, with index and session metadata
//! - [`StatusLineVerifier`]: continuity check on the hardware counter embedded in frames
//! - [`StreamError`]: error type returned across crate boundaries
//!
//! ## Example
//!
//! ```rust
//! use stream_core::{Frame, FrameBatch};
//! # fn main() -> stream_core::StreamResult<()> {
//! let frames = (0..10)
//!     .map(|_| Frame::from_u16(4, 4, &[0u16; 16]))
//!     .collect::<Result<Vec<_>, _>>()?;
//! let batch = FrameBatch::new(frames, 20)?;
//! assert_eq!(batch.last_index(), 29);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod data;
pub mod error;
pub mod status_line;

pub use batch::{BatchHeader, FrameBatch, FrameInfo, FramePosition};
pub use data::{Frame, PixelType};
pub use error::{FrameWriteError, StreamError, StreamResult};
pub use status_line::{
    read_status_counter, write_status_line, StatusLineCheck, StatusLineVerifier,
};
