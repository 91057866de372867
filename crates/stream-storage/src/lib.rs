//! `stream-storage`
//!
//! Everything in the framestream pipeline that touches the disk, plus the
//! pretrigger ring that buffers batches outside of a save session.
//!
//! # File layout of one save
//!
//! ```text
//! <base>[_NNNN].<ext>     frames (raw / cam / tiff / bigtiff)
//! <base>_frameinfo.dat    per-frame auxiliary rows keyed by save index
//! <base>_eventlog.dat     timestamped session events
//! <base>_background.bin   background snapshot taken at save start
//! <base>_settings.dat     settings at start, merged with final counters at stop
//! ```

pub mod background;
pub mod disk_writer;
pub mod event_log;
pub mod format;
pub mod frame_info;
pub mod path;
pub mod pretrigger;
pub mod settings_file;
pub mod tiff_writer;

pub use background::{write_background, BackgroundDescriptor, BackgroundSnapshot};
pub use disk_writer::{DiskWriter, SplitCursor, WriterOptions};
pub use event_log::EventLog;
pub use format::SaveFormat;
pub use frame_info::FrameInfoWriter;
pub use path::{remove_if_exists, PathKind, SavePath};
pub use pretrigger::{PretriggerBuffer, PretriggerStatus};
pub use settings_file::SettingsDict;
pub use tiff_writer::TiffStackWriter;
