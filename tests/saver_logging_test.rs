//! Log output of the save path.

use std::sync::Arc;
use std::time::Duration;

use framestream::{
    config::SaverConfig, Frame, FrameBatch, ResourceRegistry, SaveFormat, SaveOptions,
    SessionController,
};
use tempfile::TempDir;
use tracing_test::traced_test;

fn batch(first: u64, n: usize) -> FrameBatch {
    let frames = (0..n)
        .map(|_| Frame::from_u16(8, 8, &[1u16; 64]).unwrap())
        .collect();
    FrameBatch::new(frames, first).unwrap()
}

fn controller() -> SessionController {
    let mut config = SaverConfig::default();
    config.saver.chunk_period = Duration::from_secs(60);
    SessionController::new(&config, Arc::new(ResourceRegistry::new()))
}

#[test]
#[traced_test]
fn ram_drop_warns_once_per_session() {
    let dir = TempDir::new().unwrap();
    let mut c = controller();
    c.save_start(SaveOptions::new(dir.path().join("run")).with_format(SaveFormat::Raw))
        .unwrap();
    c.setup_queue_ram(0);
    c.submit(batch(1, 2));
    c.submit(batch(3, 2));

    assert!(logs_contain("Save started"));
    logs_assert(|lines: &[&str]| {
        let warnings = lines
            .iter()
            .filter(|line| line.contains("Save queue RAM budget exceeded"))
            .count();
        match warnings {
            1 => Ok(()),
            n => Err(format!("expected one drop warning, saw {}", n)),
        }
    });
}

#[test]
#[traced_test]
fn write_error_is_logged() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("run_0001.bin")).unwrap();
    let mut c = controller();
    c.save_start(
        SaveOptions::new(dir.path().join("run"))
            .with_format(SaveFormat::Raw)
            .with_file_split(1),
    )
    .unwrap();
    c.submit(batch(1, 2));
    c.flush();

    assert!(logs_contain("Frame write failed, stopping save"));
    assert!(logs_contain("Save finished"));
}
