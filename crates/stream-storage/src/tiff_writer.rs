//! Multi-page TIFF and BigTIFF streaming.
//!
//! Each frame becomes one image directory appended to the open file; the
//! encoder stays alive across chunks so a session produces one multi-page
//! stack per (split) file. Float frames are stored as 32-bit float pages,
//! integer frames keep their sample width.
//!
//! Plain TIFF uses 32-bit offsets. `max_file_bytes` puts a ceiling on the file
//! size; a write that would cross it fails with a [`FrameWriteError`] carrying
//! the number of frames already written, so the caller can reconcile its
//! counters. BigTIFF lifts the offset limit and normally runs without a ceiling.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use stream_core::{Frame, FrameWriteError, PixelType};
use tiff::encoder::{colortype, TiffEncoder, TiffKind, TiffKindBig, TiffKindStandard};

use crate::disk_writer::SplitCursor;
use crate::path::{remove_if_exists, SavePath};

/// Space reserved per page for the image directory and its tag values.
const IFD_RESERVE: u64 = 512;

/// File handle that keeps track of the file size for the ceiling check.
struct TrackedFile {
    file: File,
    pos: u64,
    len: Arc<AtomicU64>,
}

impl Write for TrackedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.pos += n as u64;
        self.len.fetch_max(self.pos, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for TrackedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.file.seek(pos)?;
        Ok(self.pos)
    }
}

enum Encoder {
    Standard(TiffEncoder<TrackedFile, TiffKindStandard>),
    Big(TiffEncoder<TrackedFile, TiffKindBig>),
}

fn write_page<K: TiffKind>(encoder: &mut TiffEncoder<TrackedFile, K>, frame: &Frame) -> Result<()> {
    let (w, h) = (frame.width, frame.height);
    match frame.pixel_type {
        PixelType::U8 => encoder.write_image::<colortype::Gray8>(w, h, &frame.to_u8_vec()),
        PixelType::U16 => encoder.write_image::<colortype::Gray16>(w, h, &frame.to_u16_vec()),
        PixelType::U32 => encoder.write_image::<colortype::Gray32>(w, h, &frame.to_u32_vec()),
        PixelType::F32 | PixelType::F64 => {
            encoder.write_image::<colortype::Gray32Float>(w, h, &frame.to_f32_vec())
        }
    }
    .context("Failed to encode TIFF page")
}

fn page_bytes(frame: &Frame) -> u64 {
    let sample = match frame.pixel_type {
        PixelType::U8 => 1,
        PixelType::U16 => 2,
        PixelType::U32 | PixelType::F32 | PixelType::F64 => 4,
    };
    frame.pixel_count() as u64 * sample + IFD_RESERVE
}

/// Split a run of frames into the groups written back to back.
///
/// Runs of exactly three or four frames are written as `2 + 1` and `2 + 2`,
/// so they are never taken for a single colour image.
pub fn write_groups(frames: &[Frame]) -> Vec<&[Frame]> {
    match frames.len() {
        0 => Vec::new(),
        3 | 4 => {
            let (a, b) = frames.split_at(2);
            vec![a, b]
        }
        _ => vec![frames],
    }
}

/// Streaming writer for the `tiff` and `bigtiff` formats.
pub struct TiffStackWriter {
    path: SavePath,
    cursor: SplitCursor,
    big: bool,
    max_file_bytes: Option<u64>,
    encoder: Option<Encoder>,
    file_len: Arc<AtomicU64>,
    current: Option<PathBuf>,
    files: Vec<PathBuf>,
}

impl TiffStackWriter {
    /// Create a writer; no file is opened until the first frame arrives.
    pub fn new(path: SavePath, cursor: SplitCursor, big: bool, max_file_bytes: Option<u64>) -> Self {
        Self {
            path,
            cursor,
            big,
            max_file_bytes,
            encoder: None,
            file_len: Arc::new(AtomicU64::new(0)),
            current: None,
            files: Vec::new(),
        }
    }

    fn open(&mut self) -> Result<()> {
        let path = self.path.data_path(self.cursor.file_index());
        let file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        self.file_len.store(0, Ordering::Relaxed);
        let tracked = TrackedFile {
            file,
            pos: 0,
            len: Arc::clone(&self.file_len),
        };
        let encoder = if self.big {
            Encoder::Big(TiffEncoder::new_big(tracked).context("Failed to start BigTIFF file")?)
        } else {
            Encoder::Standard(TiffEncoder::new(tracked).context("Failed to start TIFF file")?)
        };
        tracing::debug!(path = ?path, bigtiff = self.big, "Opened TIFF file");
        self.encoder = Some(encoder);
        self.files.push(path.clone());
        self.current = Some(path);
        Ok(())
    }

    fn check_ceiling(&self, group: &[Frame]) -> Result<()> {
        let Some(limit) = self.max_file_bytes else {
            return Ok(());
        };
        let needed: u64 = group.iter().map(page_bytes).sum();
        let len = self.file_len.load(Ordering::Relaxed);
        if len + needed > limit {
            return Err(anyhow!(
                "TIFF file {:?} would exceed {} bytes ({} written, {} needed)",
                self.current,
                limit,
                len,
                needed
            ));
        }
        Ok(())
    }

    /// Append `frames`; returns the number written.
    pub fn write_frames(&mut self, frames: &[Frame]) -> Result<u64, FrameWriteError> {
        let mut saved = 0u64;
        let mut rest = frames;
        while !rest.is_empty() {
            let take = self.cursor.room().min(rest.len() as u64) as usize;
            let (segment, tail) = rest.split_at(take);
            rest = tail;
            for group in write_groups(segment) {
                if self.encoder.is_none() {
                    self.open().map_err(|e| FrameWriteError::new(saved, e))?;
                }
                self.check_ceiling(group)
                    .map_err(|e| FrameWriteError::new(saved, e))?;
                for frame in group {
                    let result = match self.encoder.as_mut() {
                        Some(Encoder::Standard(enc)) => write_page(enc, frame),
                        Some(Encoder::Big(enc)) => write_page(enc, frame),
                        None => Err(anyhow!("TIFF file is not open")),
                    };
                    result.map_err(|e| FrameWriteError::new(saved, e))?;
                    saved += 1;
                }
                if self.cursor.advance(group.len() as u64) {
                    self.close().map_err(|e| FrameWriteError::new(saved, e))?;
                    let next = self.path.data_path(self.cursor.file_index());
                    remove_if_exists(&next).map_err(|e| FrameWriteError::new(saved, e))?;
                }
            }
        }
        Ok(saved)
    }

    /// Finish the current file.
    pub fn close(&mut self) -> Result<()> {
        if self.encoder.take().is_some() {
            tracing::debug!(
                path = ?self.current,
                bytes = self.file_len.load(Ordering::Relaxed),
                "Closed TIFF file"
            );
        }
        self.current = None;
        Ok(())
    }

    /// Files opened during this session.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Frames written during this session.
    pub fn frames_written(&self) -> u64 {
        self.cursor.written()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SaveFormat;
    use crate::path::PathKind;
    use tempfile::TempDir;
    use tiff::decoder::{Decoder, DecodingResult};

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::from_u16(16, 16, &[i as u16 * 100; 256]).unwrap())
            .collect()
    }

    fn writer(dir: &TempDir, split: Option<u64>, big: bool, max: Option<u64>) -> TiffStackWriter {
        let path =
            SavePath::new(dir.path().join("stack.tif"), PathKind::Prefix, SaveFormat::Tiff).unwrap();
        TiffStackWriter::new(path, SplitCursor::new(split), big, max)
    }

    fn count_pages(path: &std::path::Path) -> usize {
        let mut decoder = Decoder::new(File::open(path).unwrap()).unwrap();
        let mut n = 1;
        while decoder.more_images() {
            decoder.next_image().unwrap();
            n += 1;
        }
        n
    }

    #[test]
    fn test_groups() {
        let f = frames(4);
        let lens = |n: usize| write_groups(&f[..n]).iter().map(|g| g.len()).collect::<Vec<_>>();
        assert_eq!(lens(1), vec![1]);
        assert_eq!(lens(2), vec![2]);
        assert_eq!(lens(3), vec![2, 1]);
        assert_eq!(lens(4), vec![2, 2]);
        assert!(write_groups(&[]).is_empty());
    }

    #[test]
    fn test_stack_across_calls() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, None, false, None);
        assert_eq!(w.write_frames(&frames(3)).unwrap(), 3);
        assert_eq!(w.write_frames(&frames(2)).unwrap(), 2);
        w.close().unwrap();
        let path = dir.path().join("stack.tif");
        assert_eq!(count_pages(&path), 5);

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.dimensions().unwrap(), (16, 16));
        decoder.next_image().unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => assert_eq!(data[0], 100),
            other => panic!("unexpected sample type: {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn test_split_stacks() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, Some(4), true, None);
        w.write_frames(&frames(10)).unwrap();
        w.close().unwrap();
        let pages: Vec<usize> = (0..3)
            .map(|i| count_pages(&dir.path().join(format!("stack_{:04}.tif", i))))
            .collect();
        assert_eq!(pages, vec![4, 4, 2]);
        assert_eq!(w.files().len(), 3);
    }

    #[test]
    fn test_float_frames_written_as_f32() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, None, false, None);
        let f = Frame::from_f64(2, 2, &[0.5, 1.0, 1.5, 2.0]).unwrap();
        w.write_frames(&[f]).unwrap();
        w.close().unwrap();
        let mut decoder = Decoder::new(File::open(dir.path().join("stack.tif")).unwrap()).unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::F32(data) => assert_eq!(data, vec![0.5, 1.0, 1.5, 2.0]),
            other => panic!("unexpected sample type: {:?}", std::mem::discriminant(&other)),
        }
    }

    #[test]
    fn test_size_ceiling_reports_partial_write() {
        let dir = TempDir::new().unwrap();
        // Room for the first group of two 16x16 pages, not for the second.
        let mut w = writer(&dir, None, false, Some(2600));
        let err = w.write_frames(&frames(4)).unwrap_err();
        assert_eq!(err.saved, 2);
        assert!(err.source.to_string().contains("exceed"));
        w.close().unwrap();
        assert_eq!(count_pages(&dir.path().join("stack.tif")), 2);
    }
}
