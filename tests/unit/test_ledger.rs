//! Version ledger persistence tests.

use std::sync::Arc;

use cicd_agent::version::{Colour, VersionLedger};

#[tokio::test]
async fn test_ledger_file_shape() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = VersionLedger::new();
    ledger.set_live_colour(dir.path(), Colour::V2).await.unwrap();
    ledger
        .record_duration(dir.path(), "step_9_pullOnline", 42.125)
        .await
        .unwrap();

    let raw = std::fs::read_to_string(dir.path().join(".current")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["current_version"], "v2");
    assert_eq!(json["step_durations"]["step_9_pullOnline"], 42.13);
    assert!(json["last_updated"].as_str().unwrap().contains('-'));

    // pretty-printed, and no temp file left behind
    assert!(raw.contains('\n'));
    assert!(!dir.path().join(".current.tmp").exists());
}

#[tokio::test]
async fn test_concurrent_duration_writes_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(VersionLedger::new());

    let mut handles = Vec::new();
    for step in 9..=16 {
        let ledger = ledger.clone();
        let base = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            ledger
                .record_duration(&base, &format!("step_{}_x", step), step as f64)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = ledger.read(dir.path()).await.unwrap();
    assert_eq!(record.step_durations.len(), 8);
    assert_eq!(record.duration_secs("step_12_x"), Some(12.0));
}

#[tokio::test]
async fn test_failed_double_rollout_leaves_colour_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = VersionLedger::new();
    ledger.set_live_colour(dir.path(), Colour::V1).await.unwrap();

    // a failed rollout only records step durations, never the colour
    ledger
        .record_duration(dir.path(), "step_14_checkService", 180.0)
        .await
        .unwrap();

    assert_eq!(ledger.live_colour(dir.path()).await.unwrap(), Colour::V1);
}

#[tokio::test]
async fn test_tolerates_loose_duration_values() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(".current"),
        r#"{"current_version":"v1","last_updated":"2025-01-01 00:00:00","step_durations":{"step_9_pullOnline":"not-a-number","step_10_tagImages":7.5}}"#,
    )
    .unwrap();

    let ledger = VersionLedger::new();
    let record = ledger.read(dir.path()).await.unwrap();
    assert_eq!(record.duration_secs("step_9_pullOnline"), None);
    assert_eq!(record.duration_secs("step_10_tagImages"), Some(7.5));
}
