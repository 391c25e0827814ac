//! The watcher-driven reconciliation path: files edited behind the
//! store's back are folded into the cache, while the store's own disk
//! activity stays silent.

use std::time::Duration;

use arbordb_core::{ExternalModificationKind, Query};
use arbordb_testkit::prelude::*;
use serde_json::json;

#[tokio::test]
async fn hand_dropped_files_are_picked_up() {
    let fixture = TestStore::open().await;
    let mut changes = fixture.subscribe();

    fixture.write_raw(
        "report/config.json",
        "{\"_id\": \"r1\", \"name\": \"report\", \"$entitySet\": \"templates\"}",
    );
    fixture.write_raw("report/content.html", "dropped in");

    eventually("the new document to appear", || {
        fixture
            .find("templates", Query::field("name", "report"))
            .count()
            .unwrap()
            == 1
    })
    .await;

    let seen = changes.recv().await.unwrap();
    assert_eq!(seen.kind, ExternalModificationKind::Reload);
}

#[tokio::test]
async fn edited_property_files_update_the_document() {
    let fixture = TestStore::open().await;
    fixture
        .insert("templates", template("page", "before"))
        .await
        .unwrap();

    // wait out the debounce window for the store's own writes
    tokio::time::sleep(Duration::from_millis(200)).await;
    fixture.write_raw("page/content.html", "after");

    eventually("the edit to be reconciled", || {
        fixture
            .find("templates", Query::field("name", "page"))
            .first()
            .unwrap()
            .is_some_and(|doc| doc.field("content") == Some(&json!("after")))
    })
    .await;
}

#[tokio::test]
async fn own_writes_stay_silent() {
    let fixture = TestStore::open().await;
    let mut changes = fixture.subscribe();

    fixture
        .insert("templates", template("quiet", "shh"))
        .await
        .unwrap();
    fixture
        .insert("settings", json!({"noise": false}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        changes.try_recv().is_err(),
        "own writes must not come back as external modifications"
    );
    assert_eq!(fixture.find("templates", Query::all()).count().unwrap(), 1);
}

#[tokio::test]
async fn deleting_a_document_directory_by_hand_is_noticed() {
    let fixture = TestStore::open().await;
    fixture
        .insert("templates", template("doomed", "x"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::remove_dir_all(fixture.file("doomed")).unwrap();

    eventually("the removal to be reconciled", || {
        fixture.find("templates", Query::all()).count().unwrap() == 0
    })
    .await;
}
