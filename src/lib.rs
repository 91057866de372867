//! # framestream
//!
//! Frame streaming and persistence for scientific cameras. A capture source
//! hands over batches of frames; the saver admits them against a RAM budget,
//! groups them into time chunks and writes them to disk in one of the
//! supported container formats, with settings, frame info and event log
//! side files. Between sessions, batches feed an optional pretrigger ring
//! that is replayed at the start of the next save.
//!
//! ## Crate Structure
//!
//! - **`config`**: `SaverConfig`, loaded with figment from TOML plus
//!   `FRAMESTREAM_*` environment overrides.
//! - **`logging`**: tracing subscriber setup (pretty, compact or JSON).
//! - **`registry`**: named settings and background sources queried at save
//!   start and stop.
//! - **`scheduler`**: admission, drop accounting and time chunking.
//! - **`session`**: the `Stopped`/`Saving`/`Stopping` state machine and the
//!   flush jobs that write chunks.
//! - **`messages`** / **`saver_actor`**: the async actor owning the session
//!   and its cloneable handle.
//!
//! Frame and batch types live in `stream-core`; formats, writers and side
//! files in `stream-storage`. Both are re-exported here.

pub mod config;
pub mod logging;
pub mod messages;
pub mod registry;
pub mod saver_actor;
pub mod scheduler;
pub mod session;

pub use config::SaverConfig;
pub use registry::{BackgroundSource, ResourceRegistry, SettingsSource};
pub use saver_actor::{FrameSaver, FrameSaverHandle};
pub use scheduler::{Admission, SaveCounters, SaveScheduler};
pub use session::{
    PretriggerOptions, SaveOptions, SaveState, SaveStatus, SessionController,
};

pub use stream_core::{
    BatchHeader, Frame, FrameBatch, FrameInfo, FramePosition, PixelType, StatusLineCheck,
    StreamError, StreamResult,
};
pub use stream_storage::{BackgroundSnapshot, PathKind, SaveFormat, SettingsDict};
