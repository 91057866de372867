//! Save session state machine.
//!
//! ```text
//! Stopped --save_start--> Saving --save_stop--> Stopping --queue drained--> Stopped
//!                            \______________ write error ______________/
//! ```
//!
//! [`SessionController`] owns the scheduler, the pretrigger ring and the
//! writers of the active session. It is deliberately synchronous: the
//! [`FrameSaver`](crate::saver_actor::FrameSaver) actor confines it to one task
//! and moves the disk writes of each flush tick onto a blocking thread via
//! [`prepare_flush`](SessionController::prepare_flush), [`FlushJob::run`] and
//! [`complete_flush`](SessionController::complete_flush). Tests drive it
//! directly with [`flush`](SessionController::flush).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stream_core::{
    BatchHeader, Frame, FrameBatch, FrameWriteError, StatusLineCheck, StatusLineVerifier,
    StreamError, StreamResult,
};
use stream_storage::{
    write_background, BackgroundDescriptor, DiskWriter, EventLog, FrameInfoWriter, PathKind,
    PretriggerBuffer, PretriggerStatus, SaveFormat, SavePath, SettingsDict, WriterOptions,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PretriggerConfig, QueueConfig, ResourceConfig, SaverConfig};
use crate::registry::ResourceRegistry;
use crate::scheduler::{Admission, Chunk, SaveCounters, SaveScheduler};

/// Persistence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveState {
    /// No session; batches only feed the pretrigger ring
    #[default]
    Stopped,
    /// Batches are admitted and written
    Saving,
    /// No new batches; the queue is being drained
    Stopping,
}

impl SaveState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            SaveState::Stopped => "stopped",
            SaveState::Saving => "saving",
            SaveState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of one save session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOptions {
    /// Base path of the save
    pub path: PathBuf,
    /// How `path` is interpreted
    pub path_kind: PathKind,
    /// Container format of the data files
    pub format: SaveFormat,
    /// Stop after this many frames
    pub batch_size: Option<u64>,
    /// Maximum frames per data file
    pub file_split: Option<u64>,
    /// Append to existing files instead of replacing them
    pub append: bool,
    /// Write the settings file (and background snapshot)
    pub save_settings: bool,
    /// Verify embedded status-line counters
    pub check_status_line: bool,
    /// Free-form settings stored under `extra`
    pub extra_settings: Option<Value>,
}

impl SaveOptions {
    /// Options for a prefix save at `path` in the default format.
    ///
    /// No settings file is written unless requested with
    /// [`with_save_settings`](Self::with_save_settings).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            path_kind: PathKind::default(),
            format: SaveFormat::default(),
            batch_size: None,
            file_split: None,
            append: false,
            save_settings: false,
            check_status_line: false,
            extra_settings: None,
        }
    }

    /// Set the path kind.
    pub fn with_path_kind(mut self, path_kind: PathKind) -> Self {
        self.path_kind = path_kind;
        self
    }

    /// Set the data format.
    pub fn with_format(mut self, format: SaveFormat) -> Self {
        self.format = format;
        self
    }

    /// Stop after `frames` frames.
    pub fn with_batch_size(mut self, frames: u64) -> Self {
        self.batch_size = Some(frames);
        self
    }

    /// Start a new data file every `frames` frames.
    pub fn with_file_split(mut self, frames: u64) -> Self {
        self.file_split = Some(frames);
        self
    }

    /// Append to existing files.
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Write the settings file.
    pub fn with_save_settings(mut self, save_settings: bool) -> Self {
        self.save_settings = save_settings;
        self
    }

    /// Verify status-line counters.
    pub fn with_status_line_check(mut self, check: bool) -> Self {
        self.check_status_line = check;
        self
    }

    /// Attach extra settings.
    pub fn with_extra_settings(mut self, extra: Value) -> Self {
        self.extra_settings = Some(extra);
        self
    }

    /// Reject zero limits.
    pub fn validate(&self) -> StreamResult<()> {
        if self.batch_size == Some(0) {
            return Err(StreamError::Configuration(
                "batch_size must be positive when set".to_string(),
            ));
        }
        if self.file_split == Some(0) {
            return Err(StreamError::Configuration(
                "file_split must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pretrigger ring setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PretriggerOptions {
    /// Capacity in frames
    pub size: usize,
    /// Keep a ring at all
    pub enabled: bool,
    /// Carry buffered batches over when the size changes
    pub preserve_frames: bool,
    /// Empty the ring once replayed into a save
    pub clear_on_write: bool,
}

impl PretriggerOptions {
    /// Enabled ring of `size` frames.
    pub fn enabled(size: usize) -> Self {
        Self {
            size,
            enabled: true,
            preserve_frames: true,
            clear_on_write: true,
        }
    }

    /// No ring.
    pub fn disabled() -> Self {
        Self {
            size: 0,
            enabled: false,
            preserve_frames: false,
            clear_on_write: true,
        }
    }

    /// Set whether buffered batches survive a resize.
    pub fn with_preserve_frames(mut self, preserve: bool) -> Self {
        self.preserve_frames = preserve;
        self
    }

    /// Set whether a replay empties the ring.
    pub fn with_clear_on_write(mut self, clear: bool) -> Self {
        self.clear_on_write = clear;
        self
    }
}

/// Where and when a frame was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMark {
    /// Hardware index
    pub index: u64,
    /// Capture session id
    pub session_id: u64,
    /// Creation time of the batch holding the frame
    pub timestamp: DateTime<Utc>,
}

impl FrameMark {
    /// Mark of the `k`-th frame (0-based) across `batches`.
    fn nth(batches: &[FrameBatch], mut k: u64) -> Option<Self> {
        for batch in batches {
            let len = batch.len() as u64;
            if k < len {
                return Some(Self {
                    index: batch.first_index() + k * batch.step(),
                    session_id: batch.session_id(),
                    timestamp: batch.creation_time(),
                });
            }
            k -= len;
        }
        None
    }
}

/// Observable saver state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveStatus {
    /// Current state
    pub state: SaveState,
    /// Data path of the current or last session
    pub path: Option<String>,
    /// Format of the current or last session
    pub format: Option<SaveFormat>,
    /// Frame limit
    pub batch_size: Option<u64>,
    /// Frames per data file
    pub file_split: Option<u64>,
    /// Session counters
    #[serde(flatten)]
    pub counters: SaveCounters,
    /// Frames admitted but not yet written
    pub pending: u64,
    /// Bytes charged to the queue
    pub queue_ram: u64,
    /// Admission ceiling
    pub max_queue_ram: u64,
    /// Pretrigger occupancy, if a ring is configured
    pub pretrigger: Option<PretriggerStatus>,
    /// Status-line verdict of the session
    pub status_line_check: StatusLineCheck,
    /// Identifier of the current or last session
    pub session_id: Option<Uuid>,
    /// Error that ended the last session early
    pub last_error: Option<String>,
}

/// Writers a flush job needs, moved to the job while it runs.
pub struct ChunkSink {
    writer: DiskWriter,
    frame_info: FrameInfoWriter,
    verifier: StatusLineVerifier,
    status_line: StatusLineCheck,
}

impl ChunkSink {
    fn new(writer: DiskWriter, frame_info: FrameInfoWriter, status_line: StatusLineCheck) -> Self {
        Self {
            writer,
            frame_info,
            verifier: StatusLineVerifier::new(),
            status_line,
        }
    }

    fn check_status_line(&mut self, chunk: &Chunk) {
        for batch in chunk.batches() {
            if !self.status_line.is_pending() {
                return;
            }
            self.status_line = if batch.has_status_line() {
                self.verifier.check(batch.frames(), batch.step())
            } else {
                StatusLineCheck::NoStatusLine
            };
        }
    }
}

#[derive(Debug, Clone)]
struct ChunkResult {
    frames: u64,
    nbytes: u64,
    saved: u64,
    first: Option<FrameMark>,
    last: Option<FrameMark>,
    frame: Option<((u32, u32), &'static str)>,
}

impl ChunkResult {
    fn new(chunk: &Chunk, saved: u64) -> Self {
        let batches = chunk.batches();
        let last = saved.checked_sub(1).and_then(|k| FrameMark::nth(batches, k));
        let frame = saved
            .checked_sub(1)
            .and_then(|k| {
                batches
                    .iter()
                    .flat_map(FrameBatch::frames)
                    .nth(usize::try_from(k).ok()?)
            })
            .map(|f: &Frame| (f.shape(), f.pixel_type.dtype_str()));
        Self {
            frames: chunk.frames(),
            nbytes: chunk.nbytes(),
            saved,
            first: if saved > 0 { FrameMark::nth(batches, 0) } else { None },
            last,
            frame,
        }
    }
}

/// Disk work of one flush tick.
pub struct FlushJob {
    sink: ChunkSink,
    chunks: Vec<Chunk>,
    first_save_index: u64,
}

/// Result of [`FlushJob::run`], handed back to the controller.
pub struct FlushOutcome {
    sink: ChunkSink,
    results: Vec<ChunkResult>,
    error: Option<FrameWriteError>,
    frame_info_error: Option<String>,
}

impl FlushOutcome {
    /// Frames written by the job.
    pub fn saved(&self) -> u64 {
        self.results.iter().map(|r| r.saved).sum()
    }

    /// Write error that ended the job, if any.
    pub fn error(&self) -> Option<&FrameWriteError> {
        self.error.as_ref()
    }
}

impl FlushJob {
    /// Number of frames to write.
    pub fn frames(&self) -> u64 {
        self.chunks.iter().map(Chunk::frames).sum()
    }

    /// Write all chunks in order. Stops at the first write error; later
    /// chunks are reported unsaved.
    ///
    /// A frame info failure does not stop the job. The first one is reported
    /// in the outcome.
    pub fn run(mut self) -> FlushOutcome {
        let mut results = Vec::with_capacity(self.chunks.len());
        let mut error = None;
        let mut frame_info_error = None;
        let mut save_index = self.first_save_index;
        for chunk in &self.chunks {
            if error.is_some() {
                results.push(ChunkResult::new(chunk, 0));
                continue;
            }
            self.sink.check_status_line(chunk);
            let frames: Vec<Frame> = chunk
                .batches()
                .iter()
                .flat_map(|b| b.frames().iter().cloned())
                .collect();
            let saved = match self.sink.writer.write_frames(&frames) {
                Ok(n) => n,
                Err(e) => {
                    let n = e.saved;
                    error = Some(e);
                    n
                }
            };
            if error.is_none() {
                if let Err(e) = self.sink.frame_info.write_rows(chunk.batches(), save_index) {
                    warn!(error = %format!("{:#}", e), "Failed to write frame info rows");
                    frame_info_error.get_or_insert_with(|| format!("writing frame info: {:#}", e));
                }
            }
            debug!(frames = frames.len(), saved, "Wrote chunk");
            save_index += saved;
            results.push(ChunkResult::new(chunk, saved));
        }
        FlushOutcome {
            sink: self.sink,
            results,
            error,
            frame_info_error,
        }
    }
}

struct ActiveSession {
    path: SavePath,
    sink: Option<ChunkSink>,
    event_log: EventLog,
    settings: Option<SettingsDict>,
    first_saved: Option<FrameMark>,
    last_saved: Option<FrameMark>,
    last_frame: Option<((u32, u32), &'static str)>,
}

fn unix_seconds(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Owns the state of the saver: scheduler, pretrigger ring and active session.
pub struct SessionController {
    queue_config: QueueConfig,
    pretrigger_config: PretriggerConfig,
    resources: ResourceConfig,
    registry: Arc<ResourceRegistry>,
    state: SaveState,
    scheduler: SaveScheduler,
    pretrigger: Option<PretriggerBuffer>,
    clear_on_write: bool,
    session: Option<ActiveSession>,
    in_flight: Vec<(u64, u64)>,
    options: Option<SaveOptions>,
    path: Option<String>,
    status_line_check: StatusLineCheck,
    session_id: Option<Uuid>,
    last_error: Option<String>,
}

impl SessionController {
    /// Controller in the `Stopped` state.
    pub fn new(config: &SaverConfig, registry: Arc<ResourceRegistry>) -> Self {
        let pretrigger = config.pretrigger.enabled.then(|| {
            PretriggerBuffer::new(
                config.pretrigger.size,
                config.pretrigger.strict_size,
                config.pretrigger.clear_on_reset,
            )
        });
        Self {
            queue_config: config.saver.clone(),
            pretrigger_config: config.pretrigger.clone(),
            resources: config.resources.clone(),
            registry,
            state: SaveState::Stopped,
            scheduler: SaveScheduler::new(config.saver.chunk_period, config.saver.max_queue_ram),
            pretrigger,
            clear_on_write: config.pretrigger.clear_on_write,
            session: None,
            in_flight: Vec::new(),
            options: None,
            path: None,
            status_line_check: StatusLineCheck::Off,
            session_id: None,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SaveState {
        self.state
    }

    /// Whether a flush job is out.
    pub fn has_job_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Start a session.
    ///
    /// Path and options are checked first; a bad path leaves any running
    /// session untouched. A running session is then drained and finalized.
    pub fn save_start(&mut self, options: SaveOptions) -> StreamResult<()> {
        let path = self.validate_start(&options)?;
        if self.state != SaveState::Stopped {
            info!(state = %self.state, "Finishing previous save before starting a new one");
            self.drain();
            self.finalize();
        }
        if options.append && !options.format.supports_append() {
            warn!(format = %options.format, "Format cannot append, starting new files");
        }

        let writer = DiskWriter::create(
            path.clone(),
            &WriterOptions {
                format: options.format,
                file_split: options.file_split,
                append: options.append,
                max_file_bytes: self.queue_config.tiff_max_file_bytes,
            },
        )?;
        let frame_info = FrameInfoWriter::create(path.frame_info_path(), options.append)?;
        let start_time = Utc::now();
        let session_id = Uuid::new_v4();
        let settings = if options.save_settings {
            Some(self.write_start_settings(&path, &options, start_time, session_id)?)
        } else {
            None
        };

        self.scheduler.start(options.batch_size);
        self.status_line_check = if options.check_status_line {
            StatusLineCheck::NotAvailable
        } else {
            StatusLineCheck::Off
        };
        self.session_id = Some(session_id);
        self.last_error = None;
        self.path = Some(path.to_string());
        self.session = Some(ActiveSession {
            event_log: EventLog::new(path.event_log_path(), start_time, options.append),
            sink: Some(ChunkSink::new(writer, frame_info, self.status_line_check)),
            path,
            settings,
            first_saved: None,
            last_saved: None,
            last_frame: None,
        });
        info!(
            path = self.path.as_deref().unwrap_or_default(),
            format = %options.format,
            batch_size = ?options.batch_size,
            file_split = ?options.file_split,
            append = options.append,
            session = %session_id,
            "Save started"
        );
        self.options = Some(options);
        self.state = SaveState::Saving;

        self.replay_pretrigger();
        if self.scheduler.limit_reached() {
            self.save_stop();
        }
        Ok(())
    }

    /// Check options and resolve the save path without touching any state.
    pub fn validate_start(&self, options: &SaveOptions) -> StreamResult<SavePath> {
        options.validate()?;
        SavePath::new(&options.path, options.path_kind, options.format)
    }

    fn write_start_settings(
        &self,
        path: &SavePath,
        options: &SaveOptions,
        start_time: DateTime<Utc>,
        session_id: Uuid,
    ) -> StreamResult<SettingsDict> {
        let mut settings = self
            .registry
            .settings_dict(&self.resources.settings_source)
            .unwrap_or_default();
        let background = match self.registry.background(&self.resources.background_source) {
            Some(snapshot) => match write_background(&path.background_path(), &snapshot) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Failed to write background snapshot");
                    BackgroundDescriptor::none()
                }
            },
            None => BackgroundDescriptor::none(),
        };
        settings.insert(
            "save",
            json!({
                "path": path.to_string(),
                "path_kind": options.path_kind.as_str(),
                "batch_size": options.batch_size,
                "chunk_size": options.file_split.or(options.batch_size),
                "append": options.append,
                "format": options.format.as_str(),
                "background": background.to_value(),
                "start_timestamp": unix_seconds(start_time),
                "session_id": session_id.to_string(),
                "pretrigger_status": {
                    "start": self.pretrigger.as_ref().map(PretriggerBuffer::status),
                },
            }),
        );
        if let Some(extra) = &options.extra_settings {
            settings.insert("extra", extra.clone());
        }
        settings.save(&path.settings_path())?;
        Ok(settings)
    }

    fn replay_pretrigger(&mut self) {
        let Some(mut buffer) = self.pretrigger.take() else {
            return;
        };
        let keep = (!self.clear_on_write).then(|| buffer.clone());
        let mut replayed = 0;
        while let Some(batch) = buffer.pop_oldest() {
            let n = batch.len();
            if !self.scheduler.submit(batch).is_scheduled() {
                break;
            }
            replayed += n;
        }
        if replayed > 0 {
            debug!(frames = replayed, "Replayed pretrigger frames");
        }
        self.pretrigger = Some(keep.unwrap_or(buffer));
    }

    /// Offer a batch from the capture source.
    ///
    /// Returns whether the session accounted for it. Batches the session does
    /// not take go to the pretrigger ring.
    pub fn submit(&mut self, batch: FrameBatch) -> bool {
        match self.scheduler.submit(batch) {
            Admission::Refused(batch) => {
                if let Some(pretrigger) = self.pretrigger.as_mut() {
                    pretrigger.add_batch(batch);
                }
                false
            }
            Admission::Queued | Admission::Dropped => {
                if self.state == SaveState::Saving && self.scheduler.limit_reached() {
                    info!(frames = self.scheduler.counters().scheduled, "Frame limit reached");
                    self.save_stop();
                }
                true
            }
        }
    }

    /// Count a batch that was shed before reaching the saver.
    ///
    /// Returns `false` if no session took it into account.
    pub fn shed(&mut self, header: BatchHeader) -> bool {
        if !self.scheduler.shed(header) {
            debug!(frames = header.len, "Shed batch outside a save session");
            return false;
        }
        if self.state == SaveState::Saving && self.scheduler.limit_reached() {
            info!(frames = self.scheduler.counters().scheduled, "Frame limit reached");
            self.save_stop();
        }
        true
    }

    /// Bytes charged to the pending queue.
    pub fn queue_ram(&self) -> u64 {
        self.scheduler.queue_ram()
    }

    /// Request a graceful stop: nothing new is admitted, the queue drains.
    pub fn save_stop(&mut self) {
        if self.state != SaveState::Saving {
            return;
        }
        self.scheduler.stop_accepting();
        self.state = SaveState::Stopping;
        info!(
            pending = self.scheduler.pending_frames(),
            "Save stopping, draining queue"
        );
    }

    /// Create, resize or remove the pretrigger ring.
    pub fn setup_pretrigger(&mut self, options: PretriggerOptions) -> StreamResult<()> {
        if !options.enabled {
            if self.pretrigger.take().is_some() {
                info!("Pretrigger disabled");
            }
            self.clear_on_write = options.clear_on_write;
            return Ok(());
        }
        if options.size == 0 {
            return Err(StreamError::Configuration(
                "pretrigger size must be positive".to_string(),
            ));
        }
        self.clear_on_write = options.clear_on_write;
        self.pretrigger = Some(match self.pretrigger.take() {
            Some(buffer) if buffer.capacity() == options.size => buffer,
            Some(buffer) => buffer.resized(options.size, options.preserve_frames),
            None => PretriggerBuffer::new(
                options.size,
                self.pretrigger_config.strict_size,
                self.pretrigger_config.clear_on_reset,
            ),
        });
        info!(size = options.size, preserve = options.preserve_frames, "Pretrigger configured");
        Ok(())
    }

    /// Empty the pretrigger ring.
    pub fn clear_pretrigger(&mut self) {
        if let Some(pretrigger) = self.pretrigger.as_mut() {
            pretrigger.clear();
        }
    }

    /// Change the queue RAM ceiling.
    pub fn setup_queue_ram(&mut self, max_bytes: u64) {
        self.scheduler.set_max_queue_ram(max_bytes);
        debug!(max_bytes, "Queue RAM ceiling changed");
    }

    /// Add an entry to the event log of the active session.
    ///
    /// Returns `false` (and writes nothing) when no session is active.
    pub fn write_event_log(&mut self, message: &str) -> StreamResult<bool> {
        if self.state == SaveState::Stopped {
            return Ok(false);
        }
        let first = self.scheduler.first_seen().map(|p| p.index);
        let last = self.scheduler.last_seen().map(|p| p.index);
        match self.session.as_mut() {
            Some(session) => {
                session.event_log.write(message, first, last)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn take_job(&mut self, max_chunks: usize) -> Option<FlushJob> {
        if self.state == SaveState::Stopped
            || !self.in_flight.is_empty()
            || self.scheduler.queued_chunks() == 0
        {
            return None;
        }
        let sink = self.session.as_mut()?.sink.take()?;
        let mut chunks = Vec::new();
        while chunks.len() < max_chunks {
            match self.scheduler.pop_chunk() {
                Some(chunk) => chunks.push(chunk),
                None => break,
            }
        }
        self.in_flight = chunks.iter().map(|c| (c.frames(), c.nbytes())).collect();
        Some(FlushJob {
            sink,
            chunks,
            first_save_index: self.scheduler.counters().saved,
        })
    }

    /// Take the chunks of one flush tick, if there is anything to write.
    pub fn prepare_flush(&mut self) -> Option<FlushJob> {
        self.take_job(self.queue_config.chunks_per_flush.max(1))
    }

    /// Take every queued chunk.
    pub fn prepare_drain(&mut self) -> Option<FlushJob> {
        self.take_job(usize::MAX)
    }

    /// Fold the result of a flush job back in.
    pub fn complete_flush(&mut self, outcome: FlushOutcome) {
        self.in_flight.clear();
        let FlushOutcome {
            sink,
            results,
            error,
            frame_info_error,
        } = outcome;

        if let Some(message) = frame_info_error {
            self.last_error.get_or_insert(message);
        }

        let previous = self.status_line_check;
        self.status_line_check = sink.status_line;
        if previous.is_pending() && sink.status_line.is_anomaly() {
            warn!(check = %sink.status_line, "Status line check failed");
        }

        for r in &results {
            self.scheduler.finish_chunk(r.frames, r.nbytes, r.saved);
        }
        if let Some(session) = self.session.as_mut() {
            session.sink = Some(sink);
            for r in results.iter().filter(|r| r.saved > 0) {
                if session.first_saved.is_none() {
                    session.first_saved = r.first;
                }
                session.last_saved = r.last.or(session.last_saved);
                session.last_frame = r.frame.or(session.last_frame);
            }
        }

        if let Some(err) = error {
            self.abort(format!("{}: {:#}", err, err.source));
        } else {
            self.maybe_finalize();
        }
    }

    /// Give up on a flush job whose result is lost (the worker died).
    pub fn fail_in_flight(&mut self, reason: &str) {
        for (frames, nbytes) in std::mem::take(&mut self.in_flight) {
            self.scheduler.finish_chunk(frames, nbytes, 0);
        }
        self.abort(format!("flush job failed: {}", reason));
    }

    fn abort(&mut self, message: String) {
        let discarded = self.scheduler.discard_queue();
        error!(
            saved = self.scheduler.counters().saved,
            discarded,
            error = %message,
            "Frame write failed, stopping save"
        );
        self.last_error = Some(message);
        self.scheduler.stop_accepting();
        if self.state == SaveState::Saving {
            self.state = SaveState::Stopping;
        }
        self.finalize();
    }

    /// Finalize if a stop was requested and the queue is empty.
    pub fn maybe_finalize(&mut self) {
        if self.state == SaveState::Stopping && self.in_flight.is_empty() && self.scheduler.is_idle()
        {
            self.finalize();
        }
    }

    /// Write everything still queued, synchronously.
    pub fn drain(&mut self) {
        if !self.in_flight.is_empty() {
            warn!("Flush job still running, cannot drain");
            return;
        }
        while let Some(job) = self.prepare_drain() {
            let outcome = job.run();
            self.complete_flush(outcome);
        }
    }

    /// Close the session: writers, event log trailer, finalized settings.
    pub fn finalize(&mut self) {
        if self.state == SaveState::Stopped {
            return;
        }
        self.scheduler.stop_accepting();
        let Some(mut session) = self.session.take() else {
            self.state = SaveState::Stopped;
            return;
        };
        let mut files = 0;
        if let Some(mut sink) = session.sink.take() {
            if let Err(e) = sink.writer.close() {
                warn!(error = %format!("{:#}", e), "Failed to close data file");
                self.last_error
                    .get_or_insert_with(|| format!("closing data file: {:#}", e));
            }
            files = sink.writer.files().len();
        }
        if session.event_log.is_started() {
            let first = self.scheduler.first_seen().map(|p| p.index);
            let last = self.scheduler.last_seen().map(|p| p.index);
            if let Err(e) = session.event_log.write("Recording stopped", first, last) {
                warn!(error = %e, "Failed to write event log trailer");
            }
        }
        if let Some(mut settings) = session.settings.take() {
            self.finalize_settings(&mut settings, &session);
            if let Err(e) = settings.save(&session.path.settings_path()) {
                warn!(error = %e, "Failed to write finalized settings");
            }
        }

        let c = self.scheduler.counters();
        info!(
            path = %session.path,
            received = c.received,
            saved = c.saved,
            missed = c.missed,
            dropped = c.dropped,
            files,
            "Save finished"
        );
        self.state = SaveState::Stopped;
    }

    fn finalize_settings(&self, settings: &mut SettingsDict, session: &ActiveSession) {
        let c = self.scheduler.counters();
        let first = session.first_saved;
        let last = session.last_saved;
        settings.merge_value(
            "save",
            json!({
                "saved": c.saved,
                "scheduled": c.scheduled,
                "missed": c.missed,
                "received": c.received,
                "dropped": c.dropped,
                "discarded": c.discarded,
                "status_line_check": self.status_line_check.as_str(),
                "first_frame_timestamp": first.map(|m| unix_seconds(m.timestamp)),
                "first_frame_index": first.map(|m| m.index),
                "first_frame_session": first.map(|m| m.session_id),
                "last_frame_timestamp": last.map(|m| unix_seconds(m.timestamp)),
                "last_frame_index": last.map(|m| m.index),
                "last_frame_session": last.map(|m| m.session_id),
                "stop_timestamp": unix_seconds(Utc::now()),
                "error": self.last_error,
                "pretrigger_status": {
                    "stop": self.pretrigger.as_ref().map(PretriggerBuffer::status),
                },
            }),
        );
        if let Some(((rows, cols), dtype)) = session.last_frame {
            settings.insert("frame", json!({"shape": [rows, cols], "dtype": dtype}));
        }
        let branch = &self.resources.post_save_branch;
        if let Some(after) = self.registry.settings_dict(&self.resources.settings_source) {
            let delta = after.branch(branch);
            if !delta.is_empty() {
                settings.merge(&format!("{}_after", branch), &delta);
            }
        }
    }

    /// One synchronous flush tick.
    pub fn flush(&mut self) {
        match self.prepare_flush() {
            Some(job) => {
                let outcome = job.run();
                self.complete_flush(outcome);
            }
            None => self.maybe_finalize(),
        }
    }

    /// Snapshot of the observable state.
    pub fn status(&self) -> SaveStatus {
        let options = self.options.as_ref();
        SaveStatus {
            state: self.state,
            path: self.path.clone(),
            format: options.map(|o| o.format),
            batch_size: options.and_then(|o| o.batch_size),
            file_split: options.and_then(|o| o.file_split),
            counters: self.scheduler.counters(),
            pending: self.scheduler.pending_frames(),
            queue_ram: self.scheduler.queue_ram(),
            max_queue_ram: self.scheduler.max_queue_ram(),
            pretrigger: self.pretrigger.as_ref().map(PretriggerBuffer::status),
            status_line_check: self.status_line_check,
            session_id: self.session_id,
            last_error: self.last_error.clone(),
        }
    }
}
