//! File output through a locally installed subscriber

use tempfile::TempDir;
use uuid::Uuid;
use winlog_logging::{FileConfig, FileRotation, LogConfig, WatchContextGuard, WinlogSubscriberBuilder};

fn file_only_config(dir: &TempDir) -> LogConfig {
    let mut config = LogConfig::default();
    config.console.enabled = false;
    config.file = Some(
        FileConfig::new(dir.path())
            .with_prefix("collector")
            .with_rotation(FileRotation::Never),
    );
    config
}

#[test]
fn test_jsonl_lines_written_to_file() {
    let dir = TempDir::new().unwrap();
    let (subscriber, guard) = WinlogSubscriberBuilder::new()
        .with_config(file_only_config(&dir))
        .build()
        .unwrap();
    assert!(guard.is_some());

    tracing::subscriber::with_default(subscriber, || {
        let _watch = WatchContextGuard::new("System", Uuid::new_v4(), Uuid::new_v4());
        let span = tracing::info_span!("convert", channel = "System");
        let _entered = span.enter();
        tracing::warn!(record_id = 42u64, "render failed");
    });
    drop(guard);

    let contents = std::fs::read_to_string(dir.path().join("collector.log")).unwrap();
    let line = contents.lines().next().unwrap();
    let json: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(json["level"], "WARN");
    assert_eq!(json["message"], "render failed");
    assert_eq!(json["record_id"], 42);
    assert_eq!(json["span"]["channel"], "System");
}

#[test]
fn test_level_filter_applies_to_file() {
    let dir = TempDir::new().unwrap();
    let mut config = file_only_config(&dir);
    config.level = "error".to_string();
    let (subscriber, guard) = WinlogSubscriberBuilder::new()
        .with_config(config)
        .build()
        .unwrap();

    tracing::subscriber::with_default(subscriber, || {
        tracing::info!("dropped");
        tracing::error!("kept");
    });
    drop(guard);

    let contents = std::fs::read_to_string(dir.path().join("collector.log")).unwrap();
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("kept"));
}

#[test]
fn test_daily_rotation_creates_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("logs").join("winlog");
    let mut config = LogConfig::default();
    config.console.enabled = false;
    config.file = Some(FileConfig::new(&nested));
    let (_subscriber, guard) = WinlogSubscriberBuilder::new()
        .with_config(config)
        .build()
        .unwrap();
    assert!(guard.is_some());
    assert!(nested.is_dir());
}
