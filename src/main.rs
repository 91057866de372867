//! CLI entry point for framestream
//!
//! - `simulate`: drive a save session with a synthetic frame source and print
//!   the final status as JSON
//! - `config`: print the effective configuration
//!
//! ```bash
//! framestream simulate /tmp/run01 --format tiff --frames 500 --file-split 100
//! FRAMESTREAM_SAVER__MAX_QUEUE_RAM=1000000 framestream simulate /tmp/run02
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use framestream::{
    config::SaverConfig, logging, Frame, FrameBatch, FrameSaver, PathKind, PretriggerOptions,
    ResourceRegistry, SaveFormat, SaveOptions, SaveState,
};
use serde_json::json;
use stream_core::write_status_line;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "framestream")]
#[command(about = "Frame streaming and persistence for scientific cameras", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save frames from a synthetic source
    Simulate {
        /// Save path
        path: PathBuf,

        /// Path kind (pfx or folder)
        #[arg(long, default_value = "pfx")]
        path_kind: PathKind,

        /// Data format (raw, cam, tiff, bigtiff)
        #[arg(long, default_value = "cam")]
        format: SaveFormat,

        /// Frames to generate
        #[arg(long, default_value_t = 200)]
        frames: u64,

        /// Frames per batch
        #[arg(long, default_value_t = 10)]
        batch: usize,

        /// Frame width
        #[arg(long, default_value_t = 256)]
        width: u32,

        /// Frame height
        #[arg(long, default_value_t = 256)]
        height: u32,

        /// Stop the save after this many frames
        #[arg(long)]
        batch_size: Option<u64>,

        /// Frames per data file
        #[arg(long)]
        file_split: Option<u64>,

        /// Frames generated before the save starts, kept in a pretrigger ring
        #[arg(long)]
        pretrigger: Option<usize>,

        /// Delay between batches
        #[arg(long, default_value = "5ms", value_parser = humantime_duration)]
        interval: Duration,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::deserialize(serde_json::Value::String(s.to_string()))
        .map_err(|e: serde_json::Error| e.to_string())
}

fn load_config(path: Option<&PathBuf>) -> Result<SaverConfig> {
    let config = match path {
        Some(path) => SaverConfig::load_from(path),
        None => SaverConfig::load(),
    }
    .context("loading configuration")?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Simulate {
            path,
            path_kind,
            format,
            frames,
            batch,
            width,
            height,
            batch_size,
            file_split,
            pretrigger,
            interval,
        } => {
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            let source = SyntheticSource::new(width, height, batch.max(1));
            let mut options = SaveOptions::new(path)
                .with_path_kind(path_kind)
                .with_format(format)
                .with_save_settings(true)
                .with_status_line_check(true)
                .with_extra_settings(json!({"source": "synthetic"}));
            if let Some(n) = batch_size {
                options = options.with_batch_size(n);
            }
            if let Some(n) = file_split {
                options = options.with_file_split(n);
            }
            simulate(&config, source, options, frames, pretrigger, interval).await
        }
    }
}

/// Generates `u16` ramps with an embedded status line.
struct SyntheticSource {
    width: u32,
    height: u32,
    batch: usize,
    next_index: u64,
}

impl SyntheticSource {
    fn new(width: u32, height: u32, batch: usize) -> Self {
        Self {
            width,
            height,
            batch,
            next_index: 1,
        }
    }

    fn next_batch(&mut self, remaining: u64) -> Result<FrameBatch> {
        let n = (self.batch as u64).min(remaining) as usize;
        let first = self.next_index;
        let pixels = (self.width * self.height) as usize;
        let frames = (0..n as u64)
            .map(|k| {
                let index = first + k;
                let mut px: Vec<u16> = (0..pixels)
                    .map(|i| ((i as u64 + index) & 0x0fff) as u16)
                    .collect();
                write_status_line(&mut px, self.width, index as u32);
                Frame::from_u16(self.width, self.height, &px)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.next_index += n as u64;
        Ok(FrameBatch::new(frames, first)?.with_status_line(true))
    }
}

async fn simulate(
    config: &SaverConfig,
    mut source: SyntheticSource,
    options: SaveOptions,
    frames: u64,
    pretrigger: Option<usize>,
    interval: Duration,
) -> Result<()> {
    let registry = Arc::new(ResourceRegistry::new());
    let settings = json!({
        "cam": {"width": source.width, "height": source.height},
    });
    registry.register_settings(
        "settings",
        Arc::new(move || -> Option<serde_json::Value> { Some(settings.clone()) }),
    )?;

    let (saver, task) = FrameSaver::spawn(config, registry);
    let mut remaining = frames;

    if let Some(size) = pretrigger {
        saver.setup_pretrigger(PretriggerOptions::enabled(size)).await?;
        let mut buffered = 0;
        while buffered < size as u64 && remaining > 0 {
            let batch = source.next_batch(remaining)?;
            buffered += batch.len() as u64;
            remaining -= batch.len() as u64;
            saver.submit(batch)?;
            tokio::time::sleep(interval).await;
        }
    }

    saver.save_start(options).await?;
    saver.write_event_log("simulation started").await?;
    while remaining > 0 {
        let batch = source.next_batch(remaining)?;
        remaining -= batch.len() as u64;
        saver.submit(batch)?;
        tokio::time::sleep(interval).await;
    }
    saver.save_stop().await?;
    let status = saver
        .wait_for_state(SaveState::Stopped, Duration::from_secs(60))
        .await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    saver.shutdown().await?;
    task.await?;
    Ok(())
}
