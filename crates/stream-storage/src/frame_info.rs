//! Per-frame auxiliary table (`<base>_frameinfo.dat`).
//!
//! Tab-separated text with a `save_index` column followed by the fields the
//! capture source reported. The header is written once per file; rows are
//! keyed by the running save index of the session, so frames without info
//! leave gaps in the index column rather than shifting later rows.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use stream_core::FrameBatch;

use crate::path::remove_if_exists;

/// Appends frame info rows for one save session.
#[derive(Debug, Clone)]
pub struct FrameInfoWriter {
    path: PathBuf,
}

impl FrameInfoWriter {
    /// Prepare the table at `path`; existing content is removed unless appending.
    pub fn create(path: impl Into<PathBuf>, append: bool) -> std::io::Result<Self> {
        let path = path.into();
        if !append {
            remove_if_exists(&path)?;
        }
        Ok(Self { path })
    }

    /// Table location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the rows of `batches`, numbering frames from `first_save_index`.
    ///
    /// Nothing is written (and no file created) if none of the batches carries
    /// frame info. Returns the number of rows written.
    pub fn write_rows<'a, I>(&mut self, batches: I, first_save_index: u64) -> Result<usize>
    where
        I: IntoIterator<Item = &'a FrameBatch>,
        I::IntoIter: Clone,
    {
        let batches = batches.into_iter();
        let Some(fields) = batches
            .clone()
            .find_map(|b| b.frame_info().map(|info| info.fields.clone()))
        else {
            return Ok(0);
        };

        let needs_header = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open frame info table {:?}", self.path))?;
        let mut out = BufWriter::new(file);
        if needs_header {
            let mut header = String::from("save_index");
            for field in &fields {
                header.push('\t');
                header.push_str(field);
            }
            writeln!(out, "{}", header)?;
        }

        let mut save_index = first_save_index;
        let mut rows = 0;
        for batch in batches {
            let info = batch.frame_info();
            for i in 0..batch.len() {
                if let Some(row) = info.and_then(|info| info.rows.get(i)).and_then(|r| r.as_ref()) {
                    write!(out, "{}", save_index)?;
                    for value in row {
                        write!(out, "\t{}", value)?;
                    }
                    writeln!(out)?;
                    rows += 1;
                }
                save_index += 1;
            }
        }
        out.flush()
            .with_context(|| format!("Failed to flush frame info table {:?}", self.path))?;
        Ok(rows)
    }
}
