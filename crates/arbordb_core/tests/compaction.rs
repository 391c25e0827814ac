//! Flat-file compaction: logs shrink back to live documents without
//! disturbing them.

use std::time::Duration;

use arbordb_core::{DocumentStore, Query};
use arbordb_testkit::prelude::*;
use serde_json::json;

#[tokio::test]
async fn flat_logs_shrink_to_live_documents() {
    let fixture = TestStore::open().await;
    for n in 0..3 {
        fixture
            .insert("settings", json!({"slot": n, "value": "x"}))
            .await
            .unwrap();
    }
    fixture
        .remove("settings", Query::field("slot", 0))
        .await
        .unwrap();
    fixture
        .remove("settings", Query::field("slot", 1))
        .await
        .unwrap();

    eventually("the log to be compacted", || {
        let log = fixture.read_text("settings");
        log.lines().count() == 1 && !log.contains("$$deleted")
    })
    .await;
    assert_eq!(fixture.find("settings", Query::all()).count().unwrap(), 1);
}

#[tokio::test]
async fn startup_pass_compacts_existing_logs() {
    let dir = tempfile::tempdir().unwrap();

    // grow a tombstoned log with compaction off
    let writer = DocumentStore::open(
        fast_config(dir.path()).compaction_enabled(false),
        report_model(),
    )
    .await
    .unwrap();
    writer
        .insert("settings", json!({"key": "stays"}))
        .await
        .unwrap();
    writer
        .insert("settings", json!({"key": "goes"}))
        .await
        .unwrap();
    writer
        .remove("settings", Query::field("key", "goes"))
        .await
        .unwrap();
    writer.close().await.unwrap();
    drop(writer);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("settings"))
            .unwrap()
            .lines()
            .count(),
        3
    );

    // a long interval leaves only the eager pass at open
    let reader = DocumentStore::open(
        fast_config(dir.path()).compaction_interval(Duration::from_secs(600)),
        report_model(),
    )
    .await
    .unwrap();
    eventually("the startup pass to rewrite the log", || {
        std::fs::read_to_string(dir.path().join("settings"))
            .unwrap()
            .lines()
            .count()
            == 1
    })
    .await;
    assert_eq!(reader.find("settings", Query::all()).count().unwrap(), 1);
}

#[tokio::test]
async fn unchanged_logs_are_left_alone() {
    let fixture = TestStore::open().await;
    fixture
        .insert("settings", json!({"key": "only"}))
        .await
        .unwrap();

    let before = std::fs::metadata(fixture.file("settings")).unwrap();
    let stamp = before.modified().unwrap();

    // several intervals later the file has not been rewritten
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let after = std::fs::metadata(fixture.file("settings")).unwrap();
    assert_eq!(after.modified().unwrap(), stamp);
}
