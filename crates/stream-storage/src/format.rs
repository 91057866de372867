//! On-disk frame formats.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stream_core::StreamError;

/// Container format of the primary data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Headerless concatenation of little-endian samples
    Raw,
    /// One record per frame: `u32` height, `u32` width, `u16` samples
    #[default]
    #[serde(rename = "cam")]
    Framed,
    /// Multi-page TIFF, one image directory per frame
    Tiff,
    /// Multi-page BigTIFF (64-bit offsets)
    #[serde(rename = "bigtiff")]
    BigTiff,
}

impl SaveFormat {
    /// Tag used in settings files and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            SaveFormat::Raw => "raw",
            SaveFormat::Framed => "cam",
            SaveFormat::Tiff => "tiff",
            SaveFormat::BigTiff => "bigtiff",
        }
    }

    /// Extension used when the save path has none.
    pub fn default_extension(self) -> &'static str {
        match self {
            SaveFormat::Raw => "bin",
            SaveFormat::Framed => "cam",
            SaveFormat::Tiff | SaveFormat::BigTiff => "tif",
        }
    }

    /// Whether data files of this format can be appended to across sessions.
    pub fn supports_append(self) -> bool {
        matches!(self, SaveFormat::Raw | SaveFormat::Framed)
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(SaveFormat::Raw),
            "cam" | "framed" => Ok(SaveFormat::Framed),
            "tiff" | "tif" => Ok(SaveFormat::Tiff),
            "bigtiff" => Ok(SaveFormat::BigTiff),
            _ => Err(StreamError::UnknownFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!("raw".parse::<SaveFormat>().unwrap(), SaveFormat::Raw);
        assert_eq!("cam".parse::<SaveFormat>().unwrap(), SaveFormat::Framed);
        assert_eq!("TIFF".parse::<SaveFormat>().unwrap(), SaveFormat::Tiff);
        assert_eq!("bigtiff".parse::<SaveFormat>().unwrap(), SaveFormat::BigTiff);
    }

    #[test]
    fn test_unknown_format() {
        let err = "hdf5".parse::<SaveFormat>().unwrap_err();
        assert!(matches!(err, StreamError::UnknownFormat(ref s) if s == "hdf5"));
    }

    #[test]
    fn test_display_matches_tag() {
        for f in [SaveFormat::Raw, SaveFormat::Framed, SaveFormat::Tiff, SaveFormat::BigTiff] {
            assert_eq!(f.to_string().parse::<SaveFormat>().unwrap(), f);
        }
    }
}
