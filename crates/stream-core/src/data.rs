//! Frame data type.
//!
//! A [`Frame`] is one 2D image as delivered by the capture source. Pixel data
//! is kept in its native little-endian encoding inside a [`Bytes`] buffer, so
//! cloning a frame (or a whole batch) is a reference-count bump, not a copy.
//! Writers convert to their on-disk sample type on the way out.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// Sample type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8-bit unsigned
    U8,
    /// 16-bit unsigned (native format of most scientific sensors)
    U16,
    /// 32-bit unsigned
    U32,
    /// 32-bit float
    F32,
    /// 64-bit float (typically the output of background subtraction)
    F64,
}

impl PixelType {
    /// Bytes per sample.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
            PixelType::U32 | PixelType::F32 => 4,
            PixelType::F64 => 8,
        }
    }

    /// Whether this is a floating-point type.
    pub fn is_float(self) -> bool {
        matches!(self, PixelType::F32 | PixelType::F64)
    }

    /// Numpy-style dtype string of the in-memory encoding.
    pub fn dtype_str(self) -> &'static str {
        match self {
            PixelType::U8 => "|u1",
            PixelType::U16 => "<u2",
            PixelType::U32 => "<u4",
            PixelType::F32 => "<f4",
            PixelType::F64 => "<f8",
        }
    }
}

/// A single camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Sample type of `data`
    pub pixel_type: PixelType,

    data: Bytes,
}

impl Frame {
    /// Create a frame from raw little-endian bytes.
    ///
    /// Fails if the buffer length does not match `width * height` samples.
    pub fn from_bytes(
        width: u32,
        height: u32,
        pixel_type: PixelType,
        data: impl Into<Bytes>,
    ) -> StreamResult<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * pixel_type.bytes_per_pixel();
        if data.len() != expected {
            return Err(StreamError::Configuration(format!(
                "Frame data size mismatch: expected {} bytes for {}x{} {:?}, got {}",
                expected,
                width,
                height,
                pixel_type,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixel_type,
            data,
        })
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, pixels: Vec<u8>) -> StreamResult<Self> {
        Self::from_bytes(width, height, PixelType::U8, pixels)
    }

    /// Create a new frame from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> StreamResult<Self> {
        let data: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(width, height, PixelType::U16, data)
    }

    /// Create a new frame from 32-bit integer pixel data.
    pub fn from_u32(width: u32, height: u32, pixels: &[u32]) -> StreamResult<Self> {
        let data: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(width, height, PixelType::U32, data)
    }

    /// Create a new frame from 32-bit float pixel data.
    pub fn from_f32(width: u32, height: u32, pixels: &[f32]) -> StreamResult<Self> {
        let data: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(width, height, PixelType::F32, data)
    }

    /// Create a new frame from 64-bit float pixel data.
    pub fn from_f64(width: u32, height: u32, pixels: &[f64]) -> StreamResult<Self> {
        let data: Vec<u8> = pixels.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(width, height, PixelType::F64, data)
    }

    /// Raw little-endian sample bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the pixel data in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Number of pixels.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// Pixel at `(x, y)` as `f64`.
    pub fn get(&self, x: u32, y: u32) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.sample_f64((y * self.width + x) as usize))
    }

    /// Integer value of pixel `(x, y)`; floats are truncated.
    pub fn get_int(&self, x: u32, y: u32) -> Option<u64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.sample_int((y * self.width + x) as usize))
    }

    fn sample_bytes(&self, idx: usize) -> &[u8] {
        let bpp = self.pixel_type.bytes_per_pixel();
        &self.data[idx * bpp..(idx + 1) * bpp]
    }

    fn sample_f64(&self, idx: usize) -> f64 {
        let b = self.sample_bytes(idx);
        match self.pixel_type {
            PixelType::U8 => b[0] as f64,
            PixelType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            PixelType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            PixelType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            PixelType::F64 => {
                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
        }
    }

    fn sample_int(&self, idx: usize) -> u64 {
        let b = self.sample_bytes(idx);
        match self.pixel_type {
            PixelType::U8 => b[0] as u64,
            PixelType::U16 => u16::from_le_bytes([b[0], b[1]]) as u64,
            PixelType::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64,
            PixelType::F32 | PixelType::F64 => self.sample_f64(idx) as u64,
        }
    }

    /// Samples converted to `u8` (integers wrap, floats saturate).
    pub fn to_u8_vec(&self) -> Vec<u8> {
        if self.pixel_type == PixelType::U8 {
            return self.data.to_vec();
        }
        (0..self.pixel_count())
            .map(|i| {
                if self.pixel_type.is_float() {
                    self.sample_f64(i) as u8
                } else {
                    self.sample_int(i) as u8
                }
            })
            .collect()
    }

    /// Samples converted to `u16` (integers wrap, floats saturate).
    pub fn to_u16_vec(&self) -> Vec<u16> {
        (0..self.pixel_count())
            .map(|i| {
                if self.pixel_type.is_float() {
                    self.sample_f64(i) as u16
                } else {
                    self.sample_int(i) as u16
                }
            })
            .collect()
    }

    /// Samples converted to `u32`.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        (0..self.pixel_count())
            .map(|i| {
                if self.pixel_type.is_float() {
                    self.sample_f64(i) as u32
                } else {
                    self.sample_int(i) as u32
                }
            })
            .collect()
    }

    /// Samples converted to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        (0..self.pixel_count())
            .map(|i| self.sample_f64(i) as f32)
            .collect()
    }

    /// Samples converted to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.pixel_count()).map(|i| self.sample_f64(i)).collect()
    }

    /// Little-endian bytes of the samples converted to `u16`.
    pub fn to_u16_le_bytes(&self) -> Vec<u8> {
        if self.pixel_type == PixelType::U16 {
            return self.data.to_vec();
        }
        self.to_u16_vec()
            .into_iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    /// Little-endian bytes of the samples converted to `f64`.
    pub fn to_f64_le_bytes(&self) -> Vec<u8> {
        if self.pixel_type == PixelType::F64 {
            return self.data.to_vec();
        }
        self.to_f64_vec()
            .into_iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_roundtrip_pixels() {
        let frame = Frame::from_u16(3, 2, &[1, 2, 3, 4, 5, 65535]).unwrap();
        assert_eq!(frame.nbytes(), 12);
        assert_eq!(frame.shape(), (2, 3));
        assert_eq!(frame.get(2, 1), Some(65535.0));
        assert_eq!(frame.get_int(0, 1), Some(4));
        assert_eq!(frame.get(3, 0), None);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let result = Frame::from_bytes(4, 4, PixelType::U16, vec![0u8; 10]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("mismatch"));
    }

    #[test]
    fn test_u32_to_u16_wraps() {
        let frame = Frame::from_u32(2, 1, &[70000, 7]).unwrap();
        assert_eq!(frame.to_u16_vec(), vec![(70000u32 as u16), 7]);
    }

    #[test]
    fn test_float_conversion() {
        let frame = Frame::from_f32(2, 1, &[1.5, -2.0]).unwrap();
        assert_eq!(frame.to_f64_vec(), vec![1.5, -2.0]);
        assert_eq!(frame.to_f64_le_bytes().len(), 16);
        assert!(frame.pixel_type.is_float());
        assert_eq!(frame.pixel_type.dtype_str(), "<f4");
    }

    #[test]
    fn test_clone_shares_buffer() {
        let frame = Frame::from_u8(2, 2, vec![1, 2, 3, 4]).unwrap();
        let copy = frame.clone();
        assert_eq!(frame.data().as_ptr(), copy.data().as_ptr());
    }
}
