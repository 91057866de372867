//! Format-specific frame writers with file splitting.
//!
//! A [`DiskWriter`] is selected once per save session from the
//! [`SaveFormat`] and then receives every flushed chunk through
//! [`DiskWriter::write_frames`]. Writers keep their file handles open between
//! calls; files are opened lazily, so a split save of `N` frames with `k`
//! frames per file produces exactly `ceil(N / k)` files.
//!
//! # File preparation
//!
//! Creating a writer prepares the target:
//!
//! - unsplit, `append = false`: the data file is removed
//! - split: the unsplit data file is removed, and so is `_0000` unless appending
//! - tiff/bigtiff: the data file is always started fresh
//!
//! Whenever a split file fills up, the next index is removed before it is
//! first opened.
//!
//! Binary records go to the file unbuffered, one `write_all` per frame, so a
//! frame is counted only once the OS has taken all of its bytes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use stream_core::{Frame, FrameWriteError, StreamResult};

use crate::format::SaveFormat;
use crate::path::{remove_if_exists, SavePath};
use crate::tiff_writer::TiffStackWriter;

/// Per-session writer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// Container format
    pub format: SaveFormat,
    /// Maximum frames per physical file
    pub file_split: Option<u64>,
    /// Keep existing data instead of truncating it
    pub append: bool,
    /// Size ceiling of a single TIFF file
    pub max_file_bytes: Option<u64>,
}

impl WriterOptions {
    /// Options for `format` with no splitting, no append and no size ceiling.
    pub fn new(format: SaveFormat) -> Self {
        Self {
            format,
            file_split: None,
            append: false,
            max_file_bytes: None,
        }
    }
}

/// Tracks how many frames went into the current split file.
#[derive(Debug, Clone, Default)]
pub struct SplitCursor {
    file_split: Option<u64>,
    written: u64,
    file_index: u32,
}

impl SplitCursor {
    /// New cursor; a split of zero is treated as no split.
    pub fn new(file_split: Option<u64>) -> Self {
        Self {
            file_split: file_split.filter(|&k| k > 0),
            written: 0,
            file_index: 0,
        }
    }

    /// Index suffix of the current file, if splitting.
    pub fn file_index(&self) -> Option<u32> {
        self.file_split.map(|_| self.file_index)
    }

    /// Frames that still fit in the current file.
    pub fn room(&self) -> u64 {
        match self.file_split {
            Some(k) => k - self.written % k,
            None => u64::MAX,
        }
    }

    /// Record `n` frames written. Returns `true` if the current file is full.
    pub fn advance(&mut self, n: u64) -> bool {
        self.written += n;
        match self.file_split {
            Some(k) if n > 0 && self.written % k == 0 => {
                self.file_index += 1;
                true
            }
            _ => false,
        }
    }

    /// Total frames recorded.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Byte layout of the headerless binary formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryLayout {
    /// Samples only: `<u2` for integer frames, `<f8` for float frames
    Raw,
    /// `u32` height, `u32` width, then `<u2` samples
    Framed,
}

impl BinaryLayout {
    /// Replace `record` with the bytes of `frame`.
    fn encode(self, frame: &Frame, record: &mut Vec<u8>) {
        record.clear();
        match self {
            BinaryLayout::Raw => {
                if frame.pixel_type.is_float() {
                    record.extend_from_slice(&frame.to_f64_le_bytes());
                } else {
                    record.extend_from_slice(&frame.to_u16_le_bytes());
                }
            }
            BinaryLayout::Framed => {
                record.extend_from_slice(&frame.height.to_le_bytes());
                record.extend_from_slice(&frame.width.to_le_bytes());
                record.extend_from_slice(&frame.to_u16_le_bytes());
            }
        }
    }

    /// Write one record per frame to `out`.
    ///
    /// On failure returns the number of records written in full before the
    /// failing one, with the error.
    fn write_records(
        self,
        frames: &[Frame],
        out: &mut impl Write,
    ) -> Result<u64, (u64, std::io::Error)> {
        let mut record = Vec::new();
        let mut written = 0u64;
        for frame in frames {
            self.encode(frame, &mut record);
            out.write_all(&record).map_err(|e| (written, e))?;
            written += 1;
        }
        Ok(written)
    }
}

/// Writer for the `raw` and `cam` formats.
pub struct BinaryWriter {
    path: SavePath,
    layout: BinaryLayout,
    cursor: SplitCursor,
    file: Option<(PathBuf, File)>,
    files: Vec<PathBuf>,
}

impl BinaryWriter {
    fn new(path: SavePath, layout: BinaryLayout, cursor: SplitCursor) -> Self {
        Self {
            path,
            layout,
            cursor,
            file: None,
            files: Vec::new(),
        }
    }

    fn current_file(&mut self) -> anyhow::Result<&mut File> {
        if self.file.is_none() {
            let path = self.path.data_path(self.cursor.file_index());
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open {:?}", path))?;
            tracing::debug!(path = ?path, "Opened data file");
            if !self.files.contains(&path) {
                self.files.push(path.clone());
            }
            self.file = Some((path, file));
        }
        match self.file.as_mut() {
            Some((_, w)) => Ok(w),
            None => Err(anyhow::anyhow!("data file is not open")),
        }
    }

    fn close_file(&mut self) -> anyhow::Result<()> {
        if let Some((path, mut w)) = self.file.take() {
            w.flush()
                .with_context(|| format!("Failed to flush {:?}", path))?;
        }
        Ok(())
    }

    /// Write `frames`; returns the number written.
    ///
    /// On failure the error carries the frames of this call whose records
    /// reached the file in full. A failing record may leave a partial record
    /// at the end of the file.
    pub fn write_frames(&mut self, frames: &[Frame]) -> Result<u64, FrameWriteError> {
        let mut saved = 0u64;
        let mut rest = frames;
        while !rest.is_empty() {
            let room = usize::try_from(self.cursor.room()).unwrap_or(usize::MAX);
            let (part, tail) = rest.split_at(room.min(rest.len()));
            let layout = self.layout;
            let file = self
                .current_file()
                .map_err(|e| FrameWriteError::new(saved, e))?;
            let written = match layout.write_records(part, file) {
                Ok(n) => n,
                Err((n, e)) => {
                    self.cursor.advance(n);
                    let path = self.path.data_path(self.cursor.file_index());
                    return Err(FrameWriteError::new(
                        saved + n,
                        anyhow::Error::new(e).context(format!("Failed to write {:?}", path)),
                    ));
                }
            };
            saved += written;
            if self.cursor.advance(written) {
                self.close_file()
                    .map_err(|e| FrameWriteError::new(saved, e))?;
                let next = self.path.data_path(self.cursor.file_index());
                remove_if_exists(&next).map_err(|e| FrameWriteError::new(saved, e))?;
            }
            rest = tail;
        }
        Ok(saved)
    }
}

/// Format-specific frame writer for one save session.
pub enum DiskWriter {
    /// Headerless samples
    Raw(BinaryWriter),
    /// Per-frame records with a shape header
    Framed(BinaryWriter),
    /// Multi-page TIFF
    Tiff(TiffStackWriter),
    /// Multi-page BigTIFF
    BigTiff(TiffStackWriter),
}

impl DiskWriter {
    /// Prepare the target files and create the writer.
    pub fn create(path: SavePath, options: &WriterOptions) -> StreamResult<Self> {
        path.ensure_dir()?;
        let cursor = SplitCursor::new(options.file_split);
        let append = options.append && options.format.supports_append();
        if cursor.file_index().is_some() {
            remove_if_exists(&path.data_path(None))?;
            if !append {
                remove_if_exists(&path.data_path(Some(0)))?;
            }
        } else if !append {
            remove_if_exists(&path.data_path(None))?;
        }
        tracing::debug!(
            path = %path,
            format = %options.format,
            file_split = ?options.file_split,
            append,
            "Prepared disk writer"
        );
        Ok(match options.format {
            SaveFormat::Raw => DiskWriter::Raw(BinaryWriter::new(path, BinaryLayout::Raw, cursor)),
            SaveFormat::Framed => {
                DiskWriter::Framed(BinaryWriter::new(path, BinaryLayout::Framed, cursor))
            }
            SaveFormat::Tiff => DiskWriter::Tiff(TiffStackWriter::new(
                path,
                cursor,
                false,
                options.max_file_bytes,
            )),
            SaveFormat::BigTiff => DiskWriter::BigTiff(TiffStackWriter::new(
                path,
                cursor,
                true,
                options.max_file_bytes,
            )),
        })
    }

    /// Format of this writer.
    pub fn format(&self) -> SaveFormat {
        match self {
            DiskWriter::Raw(_) => SaveFormat::Raw,
            DiskWriter::Framed(_) => SaveFormat::Framed,
            DiskWriter::Tiff(_) => SaveFormat::Tiff,
            DiskWriter::BigTiff(_) => SaveFormat::BigTiff,
        }
    }

    /// Append `frames` to the current file(s); returns the number written.
    pub fn write_frames(&mut self, frames: &[Frame]) -> Result<u64, FrameWriteError> {
        match self {
            DiskWriter::Raw(w) | DiskWriter::Framed(w) => w.write_frames(frames),
            DiskWriter::Tiff(w) | DiskWriter::BigTiff(w) => w.write_frames(frames),
        }
    }

    /// Flush and close open files.
    pub fn close(&mut self) -> anyhow::Result<()> {
        match self {
            DiskWriter::Raw(w) | DiskWriter::Framed(w) => w.close_file(),
            DiskWriter::Tiff(w) | DiskWriter::BigTiff(w) => w.close(),
        }
    }

    /// Data files opened during this session, in order.
    pub fn files(&self) -> &[PathBuf] {
        match self {
            DiskWriter::Raw(w) | DiskWriter::Framed(w) => &w.files,
            DiskWriter::Tiff(w) | DiskWriter::BigTiff(w) => w.files(),
        }
    }

    /// Frames written during this session.
    pub fn frames_written(&self) -> u64 {
        match self {
            DiskWriter::Raw(w) | DiskWriter::Framed(w) => w.cursor.written(),
            DiskWriter::Tiff(w) | DiskWriter::BigTiff(w) => w.frames_written(),
        }
    }
}
