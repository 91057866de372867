//! Saver configuration using Figment
//!
//! Configuration is layered:
//! 1. built-in defaults ([`SaverConfig::default`])
//! 2. `config/framestream.toml` (or any file passed to [`SaverConfig::load_from`])
//! 3. environment variables prefixed with `FRAMESTREAM_`, nested keys separated
//!    by a double underscore (`FRAMESTREAM_SAVER__MAX_QUEUE_RAM=1073741824`)
//!
//! # Example
//! ```no_run
//! use framestream::config::SaverConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SaverConfig::load()?;
//! config.validate()?;
//! println!("chunk period: {:?}", config.saver.chunk_period);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use stream_core::{StreamError, StreamResult};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/framestream.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Queue and flush timing
    pub saver: QueueConfig,
    /// Pretrigger ring defaults
    pub pretrigger: PretriggerConfig,
    /// Names of registered settings/background sources
    pub resources: ResourceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Pending queue and flush job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Batches created within this window share a chunk
    #[serde(with = "humantime_serde")]
    pub chunk_period: Duration,
    /// Period of the flush job
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,
    /// Chunks written per flush tick
    pub chunks_per_flush: usize,
    /// Admission ceiling for bytes held in the pending queue
    pub max_queue_ram: u64,
    /// Size ceiling of a classic (non-big) TIFF file
    pub tiff_max_file_bytes: Option<u64>,
}

/// Pretrigger ring defaults applied at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretriggerConfig {
    /// Keep a pretrigger ring from startup
    pub enabled: bool,
    /// Ring capacity in frames
    pub size: usize,
    /// Trim the oldest batch so the ring holds exactly `size` frames
    pub strict_size: bool,
    /// Clear the ring when the capture stream restarts
    pub clear_on_reset: bool,
    /// Empty the ring once it has been replayed into a save
    pub clear_on_write: bool,
}

/// Resource registry lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Settings source snapshotted at save start and stop
    pub settings_source: String,
    /// Background source dumped at save start
    pub background_source: String,
    /// Settings branch merged into the finalized settings as `<branch>_after`
    pub post_save_branch: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "framestream".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_period: Duration::from_millis(200),
            flush_period: Duration::from_millis(20),
            chunks_per_flush: 1,
            max_queue_ram: 4 << 30,
            tiff_max_file_bytes: Some(2 << 30),
        }
    }
}

impl Default for PretriggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 100,
            strict_size: true,
            clear_on_reset: true,
            clear_on_write: true,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            settings_source: "settings".to_string(),
            background_source: "background".to_string(),
            post_save_branch: "cam/cnt".to_string(),
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl SaverConfig {
    /// Load from `config/framestream.toml` and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider, exposed so callers can add their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SaverConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FRAMESTREAM_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> StreamResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(StreamError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }
        if self.saver.chunk_period.is_zero() {
            return Err(StreamError::Configuration(
                "saver.chunk_period must be positive".to_string(),
            ));
        }
        if self.saver.flush_period.is_zero() {
            return Err(StreamError::Configuration(
                "saver.flush_period must be positive".to_string(),
            ));
        }
        if self.saver.chunks_per_flush == 0 {
            return Err(StreamError::Configuration(
                "saver.chunks_per_flush must be at least 1".to_string(),
            ));
        }
        if self.saver.tiff_max_file_bytes == Some(0) {
            return Err(StreamError::Configuration(
                "saver.tiff_max_file_bytes must be positive when set".to_string(),
            ));
        }
        if self.pretrigger.enabled && self.pretrigger.size == 0 {
            return Err(StreamError::Configuration(
                "pretrigger.size must be positive when the pretrigger is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
