//! End-to-end tests of the frame saver actor against a temporary directory.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framestream::{
    config::SaverConfig, Frame, FrameBatch, FrameSaver, FrameSaverHandle, PathKind,
    PretriggerOptions, ResourceRegistry, SaveFormat, SaveOptions, SaveState, SettingsDict,
    StatusLineCheck, StreamError,
};
use serde_json::{json, Value};
use stream_core::write_status_line;
use tempfile::TempDir;

const W: u32 = 16;
const H: u32 = 4;
const FRAME_BYTES: u64 = (W * H * 2) as u64;
const WAIT: Duration = Duration::from_secs(10);

fn frame(index: u64) -> Frame {
    let mut px = vec![(index & 0xff) as u16; (W * H) as usize];
    write_status_line(&mut px, W, index as u32);
    Frame::from_u16(W, H, &px).unwrap()
}

fn batch(first: u64, n: usize) -> FrameBatch {
    let frames = (0..n as u64).map(|k| frame(first + k)).collect();
    FrameBatch::new(frames, first).unwrap()
}

fn config(flush_period: Duration) -> SaverConfig {
    let mut config = SaverConfig::default();
    config.saver.flush_period = flush_period;
    config.saver.chunk_period = Duration::from_millis(50);
    config
}

fn spawn(config: &SaverConfig) -> (FrameSaverHandle, tokio::task::JoinHandle<()>) {
    FrameSaver::spawn(config, Arc::new(ResourceRegistry::new()))
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[tokio::test]
async fn test_contiguous_batches_then_gap() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    saver
        .save_start(SaveOptions::new(dir.path().join("run")).with_format(SaveFormat::Raw))
        .await
        .unwrap();

    for first in [0, 10, 20] {
        saver.submit(batch(first, 10)).unwrap();
    }
    let status = saver.status().await.unwrap();
    assert_eq!(status.counters.received, 30);
    assert_eq!(status.counters.scheduled, 30);
    assert_eq!(status.counters.missed, 0);

    saver.submit(batch(35, 10)).unwrap();
    let status = saver.status().await.unwrap();
    assert_eq!(status.counters.missed, 5);
    assert_eq!(status.counters.received, 40);

    saver.save_stop().await.unwrap();
    let status = saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();
    assert_eq!(status.counters.saved, 40);
    assert_eq!(file_len(&dir.path().join("run.bin")), 40 * FRAME_BYTES);

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_second_batch_dropped_when_queue_full() {
    let dir = TempDir::new().unwrap();
    // No flush tick fires during the test; shutdown drains.
    let (saver, task) = spawn(&config(Duration::from_secs(3600)));
    saver
        .save_start(SaveOptions::new(dir.path().join("run")).with_format(SaveFormat::Raw))
        .await
        .unwrap();
    // The first tick of the interval fires right away; let it pass.
    tokio::time::sleep(Duration::from_millis(20)).await;
    saver.setup_queue_ram(10 * FRAME_BYTES).await.unwrap();

    saver.submit(batch(0, 10)).unwrap();
    saver.submit(batch(10, 10)).unwrap();
    let status = saver.status().await.unwrap();
    assert_eq!(status.counters.received, 20);
    assert_eq!(status.counters.scheduled, 10);
    assert_eq!(status.counters.dropped, 10);
    assert_eq!(status.counters.missed, 10);
    assert_eq!(status.queue_ram, 10 * FRAME_BYTES);

    saver.shutdown().await.unwrap();
    task.await.unwrap();
    let status = saver.latest_status();
    assert_eq!(status.state, SaveState::Stopped);
    assert_eq!(status.counters.saved, 10);
    assert_eq!(file_len(&dir.path().join("run.bin")), 10 * FRAME_BYTES);
}

#[tokio::test]
async fn test_file_split_raw() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    saver
        .save_start(
            SaveOptions::new(dir.path().join("run"))
                .with_format(SaveFormat::Raw)
                .with_file_split(4),
        )
        .await
        .unwrap();
    saver.submit(batch(0, 10)).unwrap();
    saver.save_stop().await.unwrap();
    saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();

    let sizes: Vec<u64> = (0..3)
        .map(|i| file_len(&dir.path().join(format!("run_{:04}.bin", i))))
        .collect();
    assert_eq!(sizes, vec![4 * FRAME_BYTES, 4 * FRAME_BYTES, 2 * FRAME_BYTES]);
    assert!(!dir.path().join("run_0003.bin").exists());

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_pending_frames() {
    let dir = TempDir::new().unwrap();
    let mut config = config(Duration::from_millis(5));
    config.saver.chunk_period = Duration::from_millis(1);
    let (saver, task) = spawn(&config);
    saver
        .save_start(SaveOptions::new(dir.path().join("run.cam")))
        .await
        .unwrap();
    for i in 0..20 {
        saver.submit(batch(1 + i * 5, 5)).unwrap();
    }
    let state = saver.save_stop().await.unwrap();
    assert_ne!(state, SaveState::Saving);

    // Late batches are not part of the session.
    saver.submit(batch(101, 5)).unwrap();

    let status = saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();
    assert_eq!(status.counters.saved, 100);
    assert_eq!(status.counters.received, 100);
    assert_eq!(status.pending, 0);
    let record = 8 + FRAME_BYTES;
    assert_eq!(file_len(&dir.path().join("run.cam")), 100 * record);

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_write_error_stops_session() {
    let dir = TempDir::new().unwrap();
    // Second split file cannot be created.
    std::fs::create_dir(dir.path().join("run_0001.bin")).unwrap();

    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    saver
        .save_start(
            SaveOptions::new(dir.path().join("run"))
                .with_format(SaveFormat::Raw)
                .with_file_split(4)
                .with_save_settings(true),
        )
        .await
        .unwrap();
    saver.submit(batch(0, 10)).unwrap();

    let status = saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();
    assert_eq!(status.counters.saved, 4);
    assert_eq!(status.counters.scheduled, 10);
    assert_eq!(status.counters.discarded, 6);
    assert!(status.last_error.is_some());
    assert_eq!(file_len(&dir.path().join("run_0000.bin")), 4 * FRAME_BYTES);

    let settings = SettingsDict::load(&dir.path().join("run_settings.dat")).unwrap();
    assert_eq!(settings.get("save/saved"), Some(&json!(4)));
    assert!(settings.get("save/error").is_some_and(Value::is_string));

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_settings_snapshot_and_counters_after() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ResourceRegistry::new());
    let frames = Arc::new(AtomicU64::new(0));
    let f = frames.clone();
    registry
        .register_settings(
            "settings",
            Arc::new(move || -> Option<Value> {
                Some(json!({
                    "cam": {"exposure": 0.01, "cnt": {"frames": f.load(Ordering::SeqCst)}},
                }))
            }),
        )
        .unwrap();

    let (saver, task) = FrameSaver::spawn(&config(Duration::from_millis(5)), registry);
    saver
        .save_start(
            SaveOptions::new(dir.path().join("scan"))
                .with_path_kind(PathKind::Folder)
                .with_save_settings(true)
                .with_status_line_check(true)
                .with_extra_settings(json!({"operator": "test"})),
        )
        .await
        .unwrap();
    saver.submit(batch(1, 4)).unwrap();
    saver.submit(batch(5, 4)).unwrap();
    frames.store(8, Ordering::SeqCst);
    saver.save_stop().await.unwrap();
    let status = saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();
    assert_eq!(status.status_line_check, StatusLineCheck::Ok);

    let folder = dir.path().join("scan");
    assert!(folder.join("frames.cam").exists());
    let settings = SettingsDict::load(&folder.join("settings.dat")).unwrap();
    assert_eq!(settings.get("cam/cnt/frames"), Some(&json!(0)));
    assert_eq!(settings.get("cam/cnt_after/frames"), Some(&json!(8)));
    assert_eq!(settings.get("extra/operator"), Some(&json!("test")));
    assert_eq!(settings.get("save/status_line_check"), Some(&json!("ok")));
    assert_eq!(settings.get("save/first_frame_index"), Some(&json!(1)));
    assert_eq!(settings.get("save/last_frame_index"), Some(&json!(8)));
    assert_eq!(settings.get("save/path_kind"), Some(&json!("folder")));

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_pretrigger_replayed_into_save() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    saver
        .setup_pretrigger(PretriggerOptions::enabled(20))
        .await
        .unwrap();
    for i in 0..5 {
        saver.submit(batch(1 + i * 10, 10)).unwrap();
    }
    let status = saver.status().await.unwrap();
    assert_eq!(status.pretrigger.unwrap().frames, 20);

    saver
        .save_start(SaveOptions::new(dir.path().join("run")).with_format(SaveFormat::Raw))
        .await
        .unwrap();
    saver.submit(batch(51, 10)).unwrap();
    saver.save_stop().await.unwrap();
    let status = saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();
    assert_eq!(status.counters.saved, 30);
    assert_eq!(status.counters.missed, 0);
    assert_eq!(status.pretrigger.unwrap().frames, 0);

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_tiff_stack_pages() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    saver
        .save_start(SaveOptions::new(dir.path().join("stack")).with_format(SaveFormat::Tiff))
        .await
        .unwrap();
    saver.submit(batch(0, 3)).unwrap();
    saver.save_stop().await.unwrap();
    saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();

    let file = std::fs::File::open(dir.path().join("stack.tif")).unwrap();
    let mut decoder = tiff::decoder::Decoder::new(file).unwrap();
    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image().unwrap();
        pages += 1;
    }
    assert_eq!(pages, 3);
    assert_eq!(decoder.dimensions().unwrap(), (W, H));

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_event_log_through_handle() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_millis(5)));
    assert!(!saver.write_event_log("before").await.unwrap());
    saver
        .save_start(SaveOptions::new(dir.path().join("run.cam")))
        .await
        .unwrap();
    saver.submit(batch(3, 2)).unwrap();
    assert!(saver.write_event_log("valve open").await.unwrap());
    saver.save_stop().await.unwrap();
    saver.wait_for_state(SaveState::Stopped, WAIT).await.unwrap();

    let text = std::fs::read_to_string(dir.path().join("run_eventlog.dat")).unwrap();
    assert!(text.contains("valve open"));
    assert!(text.trim_end().ends_with("Recording stopped"));

    saver.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_dropping_handles_finalizes_session() {
    let dir = TempDir::new().unwrap();
    let (saver, task) = spawn(&config(Duration::from_secs(3600)));
    saver
        .save_start(
            SaveOptions::new(dir.path().join("run"))
                .with_format(SaveFormat::Raw)
                .with_save_settings(true),
        )
        .await
        .unwrap();
    saver.submit(batch(0, 6)).unwrap();
    drop(saver);
    task.await.unwrap();
    assert_eq!(file_len(&dir.path().join("run.bin")), 6 * FRAME_BYTES);
    assert!(dir.path().join("run_settings.dat").exists());
}

#[test]
fn test_closed_service_reported() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = runtime.block_on(async {
        let (saver, task) = spawn(&config(Duration::from_millis(5)));
        saver.shutdown().await.unwrap();
        task.await.unwrap();
        saver
    });
    let err = tokio_test::block_on(saver.status()).unwrap_err();
    assert!(matches!(err, StreamError::ServiceClosed));
    assert!(matches!(
        saver.submit(batch(0, 1)),
        Err(StreamError::ServiceClosed)
    ));
}
