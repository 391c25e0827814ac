//! Two store instances over one directory, coordinating through the
//! lock file, the watcher, and transaction markers. This is the
//! in-process stand-in for two separate processes sharing a tree.

use arbordb_core::{DocumentStore, Query, UpdateSpec};
use arbordb_testkit::prelude::*;
use tempfile::TempDir;

async fn pair() -> (TempDir, DocumentStore, DocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    let first = DocumentStore::open(fast_config(dir.path()), report_model())
        .await
        .unwrap();
    let second = DocumentStore::open(fast_config(dir.path()), report_model())
        .await
        .unwrap();
    (dir, first, second)
}

#[tokio::test]
async fn inserts_propagate_between_instances() {
    let (_dir, first, second) = pair().await;

    first
        .insert("templates", template("shared", "<p>hello</p>"))
        .await
        .unwrap();

    eventually("peer to pick up the insert", || {
        second
            .find("templates", Query::field("name", "shared"))
            .count()
            .unwrap()
            == 1
    })
    .await;

    // and the instance that wrote sees no external modification of its own
    assert_eq!(
        first.find("templates", Query::all()).count().unwrap(),
        1
    );
}

#[tokio::test]
async fn updates_and_removals_propagate_both_ways() {
    let (_dir, first, second) = pair().await;

    first
        .insert("templates", template("doc", "v1"))
        .await
        .unwrap();
    eventually("peer to see the document", || {
        second.find("templates", Query::all()).count().unwrap() == 1
    })
    .await;

    second
        .update(
            "templates",
            Query::field("name", "doc"),
            UpdateSpec::set("content", "v2"),
        )
        .await
        .unwrap();
    eventually("writer to see the peer's edit", || {
        first
            .find("templates", Query::field("name", "doc"))
            .first()
            .unwrap()
            .is_some_and(|doc| doc.field("content") == Some(&serde_json::json!("v2")))
    })
    .await;

    first.remove("templates", Query::all()).await.unwrap();
    eventually("peer to see the removal", || {
        second.find("templates", Query::all()).count().unwrap() == 0
    })
    .await;
}

#[tokio::test]
async fn committed_transactions_reach_peers() {
    let (_dir, first, second) = pair().await;

    let tx = first.begin_transaction().await.unwrap();
    first
        .insert_in("templates", template("tx-doc", "staged"), &tx)
        .await
        .unwrap();
    // staged work is invisible everywhere until commit
    assert_eq!(first.find("templates", Query::all()).count().unwrap(), 0);
    assert_eq!(second.find("templates", Query::all()).count().unwrap(), 0);

    first.commit_transaction(&tx).await.unwrap();

    eventually("peer to load the committed tree", || {
        second.find("templates", Query::all()).count().unwrap() == 1
    })
    .await;

    // the peer can mutate again once the marker is gone
    second
        .insert("settings", serde_json::json!({"after": "commit"}))
        .await
        .unwrap();
}
