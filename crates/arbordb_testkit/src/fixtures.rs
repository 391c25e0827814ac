//! Store fixtures and helpers.
//!
//! Provides a ready-made entity model, fast-timing configuration, and a
//! [`TestStore`] wrapper owning its temporary directory.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use arbordb_core::{ChangeSync, DocumentModel, DocumentStore, StoreConfig};

use crate::sync::ManualSync;

/// The entity model most tests run against: reporting templates with a
/// text body and a script, binary assets, and two flat sets.
pub fn report_model() -> DocumentModel {
    DocumentModel::builder()
        .split_set("templates", "name", |set| {
            set.text_property("content", "html")
                .text_property("helpers", "js")
        })
        .split_set("assets", "name", |set| set.binary_property("content", "bin"))
        .flat_set("settings")
        .flat_set("reports")
        .build()
        .expect("report model is valid")
}

/// Store settings tuned for tests: a short debounce and tight
/// background intervals so waits stay in the tens of milliseconds.
pub fn fast_config(root: impl Into<PathBuf>) -> StoreConfig {
    StoreConfig::new(root)
        .debounce(Duration::from_millis(25))
        .queue_sweep_interval(Duration::from_millis(100))
        .compaction_interval(Duration::from_millis(500))
}

/// A store over a temporary directory, cleaned up on drop.
pub struct TestStore {
    /// The open store.
    pub store: DocumentStore,
    config: StoreConfig,
    model: DocumentModel,
    dir: TempDir,
}

impl TestStore {
    /// Opens a store with [`report_model`] and [`fast_config`] defaults.
    pub async fn open() -> Self {
        Self::with(report_model(), |config| config).await
    }

    /// Opens a store with `model` and a customized [`fast_config`].
    pub async fn with(
        model: DocumentModel,
        configure: impl FnOnce(StoreConfig) -> StoreConfig,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = configure(fast_config(dir.path()));
        let store = DocumentStore::open(config.clone(), model.clone())
            .await
            .expect("store opens");
        Self {
            store,
            config,
            model,
            dir,
        }
    }

    /// Opens a store over a [`ManualSync`] transport and hands back the
    /// transport for injecting inbound events and inspecting published
    /// ones.
    pub async fn with_manual_sync(model: DocumentModel) -> (Self, Arc<ManualSync>) {
        let dir = TempDir::new().expect("temp dir");
        let config = fast_config(dir.path());
        let sync = Arc::new(ManualSync::default());
        let store = DocumentStore::builder(config.clone(), model.clone())
            .change_sync(Arc::clone(&sync) as Arc<dyn ChangeSync>)
            .open()
            .await
            .expect("store opens");
        let fixture = Self {
            store,
            config,
            model,
            dir,
        };
        (fixture, sync)
    }

    /// Closes the store and opens a fresh one over the same directory,
    /// running the startup recovery path against whatever is on disk.
    pub async fn reopen(self) -> Self {
        let Self {
            store,
            config,
            model,
            dir,
        } = self;
        store.close().await.expect("store closes");
        drop(store);
        let store = DocumentStore::open(config.clone(), model.clone())
            .await
            .expect("store reopens");
        Self {
            store,
            config,
            model,
            dir,
        }
    }

    /// The directory backing this store.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Absolute path of `rel` inside the data directory.
    pub fn file(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Whether `rel` exists inside the data directory.
    pub fn exists(&self, rel: impl AsRef<Path>) -> bool {
        self.file(rel).exists()
    }

    /// Reads `rel` as UTF-8, panicking when it is missing.
    pub fn read_text(&self, rel: impl AsRef<Path>) -> String {
        let path = self.file(rel);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|error| panic!("reading {}: {error}", path.display()))
    }

    /// Writes `rel` directly, creating parents, bypassing the store.
    /// This is how tests fake a peer process editing the tree.
    pub fn write_raw(&self, rel: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs");
        }
        std::fs::write(path, contents).expect("writable file");
    }

    /// Top-level entries of the data directory, lock file excluded.
    pub fn root_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .expect("readable root")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|name| name != arbordb_core::LOCK_FILE_NAME)
            .collect();
        names.sort();
        names
    }
}

impl Deref for TestStore {
    type Target = DocumentStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Polls `check` until it passes or roughly five seconds elapse.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A template document body.
pub fn template(name: &str, content: &str) -> Value {
    json!({
        "name": name,
        "content": content,
        "engine": "handlebars",
        "recipe": "html",
    })
}

/// A template body placed in the folder with `shortid`.
pub fn template_in(name: &str, content: &str, folder_shortid: &str) -> Value {
    json!({
        "name": name,
        "content": content,
        "engine": "handlebars",
        "recipe": "html",
        "folder": { "shortid": folder_shortid },
    })
}

/// A folder document body.
pub fn folder(name: &str, shortid: &str) -> Value {
    json!({ "name": name, "shortid": shortid })
}

/// An asset body carrying binary content.
pub fn asset(name: &str, bytes: &[u8]) -> Value {
    json!({ "name": name, "content": arbordb_core::encode_binary(bytes) })
}
