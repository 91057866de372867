//! Save path layout.
//!
//! A save is addressed by one base path and a [`PathKind`]:
//!
//! - `pfx`: the base is the data file itself; auxiliary files get a suffix
//!   (`run.cam`, `run_0001.cam`, `run_settings.dat`).
//! - `folder`: the base (minus extension) is a directory holding
//!   `frames[_NNNN].<ext>` plus `<name>.<ext>` auxiliary files.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stream_core::{StreamError, StreamResult};

use crate::format::SaveFormat;

/// Data file name used inside a folder save.
pub const DEFAULT_FILE_NAME: &str = "frames";

/// How the base path of a save is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathKind {
    /// Base path is the data file; auxiliary files get name suffixes
    #[default]
    #[serde(rename = "pfx")]
    Prefix,
    /// Base path names a folder containing all files
    #[serde(rename = "folder")]
    Folder,
}

impl PathKind {
    /// Tag used in settings files and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            PathKind::Prefix => "pfx",
            PathKind::Folder => "folder",
        }
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pfx" | "prefix" => Ok(PathKind::Prefix),
            "folder" => Ok(PathKind::Folder),
            _ => Err(StreamError::UnknownPathKind(s.to_string())),
        }
    }
}

/// Resolved location of all files belonging to one save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavePath {
    stem: PathBuf,
    extension: String,
    kind: PathKind,
}

impl SavePath {
    /// Validate `path` and resolve it for `format`.
    ///
    /// A missing extension is replaced by the format's default one.
    pub fn new(path: impl AsRef<Path>, kind: PathKind, format: SaveFormat) -> StreamResult<Self> {
        let path = path.as_ref();
        let invalid = |reason: &str| StreamError::InvalidPath {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        if path.as_os_str().is_empty() {
            return Err(invalid("path is empty"));
        }
        let Some(file_name) = path.file_name() else {
            return Err(invalid("path has no file name"));
        };
        if kind == PathKind::Prefix && path.is_dir() {
            return Err(invalid("path is an existing directory"));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or(format.default_extension())
            .to_string();
        let stem = match Path::new(file_name).file_stem() {
            Some(stem) => path.with_file_name(stem),
            None => path.to_path_buf(),
        };
        if kind == PathKind::Folder && stem.is_file() {
            return Err(invalid("folder path is an existing file"));
        }
        Ok(Self {
            stem,
            extension,
            kind,
        })
    }

    /// Path kind.
    pub fn kind(&self) -> PathKind {
        self.kind
    }

    /// Data file extension (without dot).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Path of the data file, or of split file `index`.
    pub fn data_path(&self, index: Option<u32>) -> PathBuf {
        let suffix = index.map(|i| format!("_{:04}", i)).unwrap_or_default();
        match self.kind {
            PathKind::Prefix => {
                let name = self.stem_name();
                self.stem
                    .with_file_name(format!("{}{}.{}", name, suffix, self.extension))
            }
            PathKind::Folder => self.stem.join(format!(
                "{}{}.{}",
                DEFAULT_FILE_NAME, suffix, self.extension
            )),
        }
    }

    /// Path of an auxiliary file such as `settings` or `eventlog`.
    pub fn aux_path(&self, name: &str, extension: &str) -> PathBuf {
        match self.kind {
            PathKind::Prefix => self.stem.with_file_name(format!(
                "{}_{}.{}",
                self.stem_name(),
                name,
                extension
            )),
            PathKind::Folder => self.stem.join(format!("{}.{}", name, extension)),
        }
    }

    /// `<base>_settings.dat`
    pub fn settings_path(&self) -> PathBuf {
        self.aux_path("settings", "dat")
    }

    /// `<base>_frameinfo.dat`
    pub fn frame_info_path(&self) -> PathBuf {
        self.aux_path("frameinfo", "dat")
    }

    /// `<base>_eventlog.dat`
    pub fn event_log_path(&self) -> PathBuf {
        self.aux_path("eventlog", "dat")
    }

    /// `<base>_background.bin`
    pub fn background_path(&self) -> PathBuf {
        self.aux_path("background", "bin")
    }

    /// Create the directory that will hold the data files.
    pub fn ensure_dir(&self) -> StreamResult<()> {
        let data = self.data_path(None);
        let Some(dir) = data.parent().filter(|d| !d.as_os_str().is_empty()) else {
            return Ok(());
        };
        fs::create_dir_all(dir).map_err(|e| StreamError::InvalidPath {
            path: self.data_path(None).display().to_string(),
            reason: format!("cannot create directory {}: {}", dir.display(), e),
        })
    }

    fn stem_name(&self) -> String {
        self.stem
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for SavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data_path(None).display())
    }
}

/// Remove `path` if it exists.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = ?path, "Removed existing file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prefix_layout() {
        let p = SavePath::new("/data/run.cam", PathKind::Prefix, SaveFormat::Framed).unwrap();
        assert_eq!(p.data_path(None), PathBuf::from("/data/run.cam"));
        assert_eq!(p.data_path(Some(3)), PathBuf::from("/data/run_0003.cam"));
        assert_eq!(p.settings_path(), PathBuf::from("/data/run_settings.dat"));
        assert_eq!(p.background_path(), PathBuf::from("/data/run_background.bin"));
    }

    #[test]
    fn test_folder_layout() {
        let p = SavePath::new("/data/run.bin", PathKind::Folder, SaveFormat::Raw).unwrap();
        assert_eq!(p.data_path(None), PathBuf::from("/data/run/frames.bin"));
        assert_eq!(p.data_path(Some(1)), PathBuf::from("/data/run/frames_0001.bin"));
        assert_eq!(p.event_log_path(), PathBuf::from("/data/run/eventlog.dat"));
    }

    #[test]
    fn test_default_extension() {
        let p = SavePath::new("/data/run", PathKind::Prefix, SaveFormat::Tiff).unwrap();
        assert_eq!(p.data_path(None), PathBuf::from("/data/run.tif"));
        assert_eq!(p.extension(), "tif");
    }

    #[test]
    fn test_invalid_paths() {
        assert!(matches!(
            SavePath::new("", PathKind::Prefix, SaveFormat::Raw),
            Err(StreamError::InvalidPath { .. })
        ));
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SavePath::new(dir.path(), PathKind::Prefix, SaveFormat::Raw),
            Err(StreamError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_ensure_dir_creates_folder() {
        let dir = TempDir::new().unwrap();
        let p = SavePath::new(dir.path().join("a/b/run.cam"), PathKind::Folder, SaveFormat::Framed)
            .unwrap();
        p.ensure_dir().unwrap();
        assert!(dir.path().join("a/b/run").is_dir());
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_if_exists(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn test_path_kind_tags() {
        assert_eq!("pfx".parse::<PathKind>().unwrap(), PathKind::Prefix);
        assert_eq!("folder".parse::<PathKind>().unwrap(), PathKind::Folder);
        assert!(matches!(
            "dir".parse::<PathKind>(),
            Err(StreamError::UnknownPathKind(_))
        ));
    }
}
