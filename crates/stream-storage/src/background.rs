//! Background snapshot (`<base>_background.bin`).
//!
//! The frame processor may hold a background (one frame, or a stack of
//! frames) that was subtracted from the live image. At save start it is
//! dumped next to the data as headerless little-endian samples, `<f8` for
//! float backgrounds and `<u2` otherwise. The returned descriptor goes into
//! the settings file so the dump can be read back.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stream_core::Frame;

/// Background frames plus the processor parameters they were taken with.
#[derive(Debug, Clone)]
pub struct BackgroundSnapshot {
    /// One frame (background only) or the full stack it was computed from
    pub frames: Vec<Frame>,
    /// Free-form snapshot parameters
    pub parameters: serde_json::Value,
}

/// Settings entry describing a background dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundDescriptor {
    /// `none`, `only_bg` or `all`
    pub saving_mode: String,
    /// Number of frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Sample type on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// `[rows, columns]` of one frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<[u32; 2]>,
    /// Container format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Snapshot parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_params: Option<serde_json::Value>,
}

impl BackgroundDescriptor {
    /// Descriptor for a save without background.
    pub fn none() -> Self {
        Self {
            saving_mode: "none".to_string(),
            size: None,
            dtype: None,
            shape: None,
            format: None,
            bg_params: None,
        }
    }

    /// As a settings value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Dump `snapshot` to `path` and describe it.
pub fn write_background(path: &Path, snapshot: &BackgroundSnapshot) -> Result<BackgroundDescriptor> {
    let Some(first) = snapshot.frames.first() else {
        return Ok(BackgroundDescriptor::none());
    };
    if snapshot
        .frames
        .iter()
        .any(|f| f.shape() != first.shape())
    {
        return Err(anyhow!("background frames have inconsistent shapes"));
    }
    let float = first.pixel_type.is_float();
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut out = BufWriter::new(file);
    for frame in &snapshot.frames {
        let bytes = if float {
            frame.to_f64_le_bytes()
        } else {
            frame.to_u16_le_bytes()
        };
        out.write_all(&bytes)?;
    }
    out.flush()?;

    let (rows, cols) = first.shape();
    tracing::debug!(path = ?path, frames = snapshot.frames.len(), "Wrote background snapshot");
    Ok(BackgroundDescriptor {
        saving_mode: if snapshot.frames.len() == 1 {
            "only_bg"
        } else {
            "all"
        }
        .to_string(),
        size: Some(snapshot.frames.len()),
        dtype: Some(if float { "<f8" } else { "<u2" }.to_string()),
        shape: Some([rows, cols]),
        format: Some("bin".to_string()),
        bg_params: Some(snapshot.parameters.clone()),
    })
}
