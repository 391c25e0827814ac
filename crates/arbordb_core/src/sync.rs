//! Change propagation between store instances sharing a data directory.
//!
//! Document writes land on disk, so peers learn about them by watching the
//! directory tree rather than over a message bus. [`FsWatchSync`] arms a
//! recursive [`notify`] watcher, drops events caused by this process' own
//! writes (the backend write mirror remembers them), coalesces external
//! bursts into a single [`SyncEvent::Reload`] and relays transaction
//! markers without delay. The only thing `publish` has to put on the wire
//! itself is the transaction begin/finish pair, written as marker files in
//! the root.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use arbordb_fs::{FsBackend, LOCK_FILE_NAME};

use crate::config::StoreConfig;
use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::layout;

/// Boxed future returned by [`ChangeSync`] operations.
pub type SyncFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Location of a document, enough to re-read it from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    /// Entity set the document belongs to.
    pub entity_set: String,
    /// Internal document id.
    pub id: String,
    /// Public key value, the directory name for split sets.
    pub key: String,
    /// `shortid` of the containing folder, `None` at the root.
    pub folder_shortid: Option<String>,
}

/// An event crossing the store boundary, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The tree changed in a way that requires re-reading it. `path` is the
    /// last changed path when known, relative to the data directory.
    Reload {
        /// Last observed change behind this reload, if any.
        path: Option<PathBuf>,
    },
    /// One document changed and should be re-read from disk. Published
    /// instead of [`SyncEvent::Update`] when the document is too large to
    /// travel inside the event.
    Refresh {
        /// Where to find the document.
        doc: DocRef,
    },
    /// A document was inserted and travels with the event.
    Insert {
        /// The inserted document.
        doc: Document,
    },
    /// A document was updated and travels with the event.
    Update {
        /// The updated document.
        doc: Document,
    },
    /// A document was removed.
    Remove {
        /// Which document disappeared.
        doc: DocRef,
    },
    /// A peer started committing a transaction; queues should pause.
    TransactionBegin {
        /// Transaction id.
        id: String,
    },
    /// A peer finished (or abandoned) a transaction.
    TransactionFinish {
        /// Transaction id.
        id: String,
    },
}

/// Transport for [`SyncEvent`]s between store instances.
///
/// Implementations decide what actually crosses the process boundary. The
/// filesystem transport relies on the data files themselves for document
/// events and only materializes transaction markers.
pub trait ChangeSync: Send + Sync + fmt::Debug {
    /// Arms the transport. Events are observed only from this point on;
    /// pre-existing files never fire.
    fn init<'a>(&'a self) -> SyncFuture<'a, ()>;

    /// Registers a listener for inbound events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent>;

    /// Announces a local event to peers.
    fn publish<'a>(&'a self, event: &'a SyncEvent) -> SyncFuture<'a, ()>;

    /// Stops observing. Subscriber channels close once in-flight events
    /// drain.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Created,
    Modified,
    Removed,
}

/// A single native watcher notification, before filtering.
#[derive(Debug)]
struct RawChange {
    kind: RawKind,
    path: PathBuf,
}

#[derive(Debug, PartialEq)]
enum Classified {
    /// Self-inflicted, reserved or otherwise uninteresting.
    Ignore,
    /// Transaction marker; bypasses the debounce window.
    Marker(SyncEvent),
    /// Genuine external change at this root-relative path.
    Content(PathBuf),
}

struct WatchInner {
    fs: Arc<dyn FsBackend>,
    debounce: Duration,
    ignored: Vec<PathBuf>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WatchInner {
    fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Decides what a native event means for the store.
    async fn classify(&self, change: &RawChange) -> Classified {
        let Ok(rel) = change.path.strip_prefix(self.fs.root_path()) else {
            return Classified::Ignore;
        };
        if rel.as_os_str().is_empty() {
            return Classified::Ignore;
        }
        for component in rel.components() {
            let name = component.as_os_str();
            if name == ".git" || name == ".DS_Store" {
                return Classified::Ignore;
            }
        }
        if rel == Path::new(LOCK_FILE_NAME) {
            return Classified::Ignore;
        }
        if self.ignored.iter().any(|prefix| rel.starts_with(prefix)) {
            return Classified::Ignore;
        }

        // Markers sit directly in the root and must be recognized before
        // the blanket `~` rule below swallows them.
        if rel.parent() == Some(Path::new("")) {
            if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
                if let Some((pid, transaction_id)) = layout::parse_marker(name) {
                    if pid == std::process::id() {
                        return Classified::Ignore;
                    }
                    return match change.kind {
                        RawKind::Created => Classified::Marker(SyncEvent::TransactionBegin {
                            id: transaction_id.to_string(),
                        }),
                        RawKind::Removed => Classified::Marker(SyncEvent::TransactionFinish {
                            id: transaction_id.to_string(),
                        }),
                        RawKind::Modified => Classified::Ignore,
                    };
                }
            }
        }

        // Everything else starting with `~` is in-flight choreography:
        // rename temps, compaction temps, transaction staging.
        let transient = rel.components().any(|component| {
            component
                .as_os_str()
                .to_str()
                .is_some_and(|name| name.starts_with('~'))
        });
        if transient {
            return Classified::Ignore;
        }

        match change.kind {
            RawKind::Created | RawKind::Modified => {
                let Ok(stat) = self.fs.stat(rel).await else {
                    // Vanished again before we could look at it.
                    return Classified::Ignore;
                };
                if stat.is_directory {
                    if self.fs.self_wrote_directory(rel) {
                        Classified::Ignore
                    } else {
                        Classified::Content(rel.to_path_buf())
                    }
                } else {
                    let Ok(content) = self.fs.read_file(rel).await else {
                        return Classified::Ignore;
                    };
                    if self.fs.self_wrote_file(rel, &content) {
                        Classified::Ignore
                    } else {
                        Classified::Content(rel.to_path_buf())
                    }
                }
            }
            RawKind::Removed => {
                // The mirror entry is cleared when this process removes a
                // path, so a surviving entry means someone else deleted it.
                if self.fs.self_wrote(rel) {
                    Classified::Content(rel.to_path_buf())
                } else {
                    Classified::Ignore
                }
            }
        }
    }
}

async fn pump(inner: Arc<WatchInner>, mut raw: mpsc::UnboundedReceiver<RawChange>) {
    let mut pending: Option<PathBuf> = None;
    loop {
        let next = if pending.is_some() {
            match tokio::time::timeout(inner.debounce, raw.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    let path = pending.take();
                    debug!(
                        target: "arbordb::sync",
                        path = ?path,
                        "external changes settled, emitting reload"
                    );
                    inner.emit(SyncEvent::Reload { path });
                    continue;
                }
            }
        } else {
            raw.recv().await
        };
        let Some(change) = next else {
            break;
        };
        match inner.classify(&change).await {
            Classified::Ignore => {}
            Classified::Marker(event) => {
                trace!(target: "arbordb::sync", event = ?event, "transaction marker observed");
                inner.emit(event);
            }
            Classified::Content(path) => {
                trace!(
                    target: "arbordb::sync",
                    path = %path.display(),
                    kind = ?change.kind,
                    "external change"
                );
                pending = Some(path);
            }
        }
    }
    if let Some(path) = pending.take() {
        inner.emit(SyncEvent::Reload { path: Some(path) });
    }
}

/// [`ChangeSync`] over a recursive filesystem watcher.
pub struct FsWatchSync {
    inner: Arc<WatchInner>,
}

impl FsWatchSync {
    /// Builds the transport over `fs`, taking the debounce window and
    /// ignored subtrees from `config`. Nothing is watched until
    /// [`ChangeSync::init`] runs.
    pub fn new(fs: Arc<dyn FsBackend>, config: &StoreConfig) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                fs,
                debounce: config.debounce,
                ignored: config.ignored_paths.clone(),
                subscribers: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }
}

impl fmt::Debug for FsWatchSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsWatchSync")
            .field("root", &self.inner.fs.root_path())
            .field("debounce", &self.inner.debounce)
            .field("armed", &self.inner.watcher.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl ChangeSync for FsWatchSync {
    fn init<'a>(&'a self) -> SyncFuture<'a, ()> {
        Box::pin(async move {
            let (raw_tx, raw_rx) = mpsc::unbounded_channel();
            let mut watcher = notify::recommended_watcher(
                move |outcome: Result<notify::Event, notify::Error>| {
                    let event = match outcome {
                        Ok(event) => event,
                        Err(error) => {
                            warn!(target: "arbordb::sync", error = %error, "watcher error");
                            return;
                        }
                    };
                    forward_native(&raw_tx, event);
                },
            )
            .map_err(|error| StoreError::watch(format!("failed to create watcher: {error}")))?;

            let root = self.inner.fs.root_path();
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|error| {
                    StoreError::watch(format!("failed to watch {}: {error}", root.display()))
                })?;
            debug!(target: "arbordb::sync", root = %root.display(), "file watcher armed");

            *self.inner.watcher.lock() = Some(watcher);
            let handle = tokio::spawn(pump(Arc::clone(&self.inner), raw_rx));
            if let Some(previous) = self.inner.pump.lock().replace(handle) {
                previous.abort();
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn publish<'a>(&'a self, event: &'a SyncEvent) -> SyncFuture<'a, ()> {
        Box::pin(async move {
            match event {
                SyncEvent::TransactionBegin { id } => {
                    let marker = PathBuf::from(layout::marker_name(std::process::id(), id));
                    self.inner.fs.write_file(&marker, b"").await?;
                }
                SyncEvent::TransactionFinish { id } => {
                    let marker = PathBuf::from(layout::marker_name(std::process::id(), id));
                    self.inner.fs.remove(&marker).await?;
                }
                // Document events already exist on disk; peer watchers pick
                // them up from there.
                _ => {}
            }
            Ok(())
        })
    }

    fn close(&self) {
        // Dropping the watcher stops the native backend. The pump may be
        // holding a half-debounced reload; abort it before clearing
        // subscribers.
        *self.inner.watcher.lock() = None;
        if let Some(handle) = self.inner.pump.lock().take() {
            handle.abort();
        }
        self.inner.subscribers.lock().clear();
    }
}

impl Drop for FsWatchSync {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fans a native notification out into per-path raw changes.
fn forward_native(tx: &mpsc::UnboundedSender<RawChange>, event: notify::Event) {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // Paths arrive as `[from, to]`.
            let mut paths = event.paths.into_iter();
            if let Some(from) = paths.next() {
                let _ = tx.send(RawChange {
                    kind: RawKind::Removed,
                    path: from,
                });
            }
            if let Some(to) = paths.next() {
                let _ = tx.send(RawChange {
                    kind: RawKind::Created,
                    path: to,
                });
            }
        }
        kind => {
            let kind = match kind {
                EventKind::Create(_) => RawKind::Created,
                EventKind::Remove(_) => RawKind::Removed,
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawKind::Removed,
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawKind::Created,
                EventKind::Modify(ModifyKind::Metadata(_)) => return,
                EventKind::Modify(_) => RawKind::Modified,
                _ => return,
            };
            for path in event.paths {
                let _ = tx.send(RawChange { kind, path });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use arbordb_fs::DirectoryFs;
    use tempfile::TempDir;

    use super::*;

    async fn transport() -> (TempDir, FsWatchSync, Arc<dyn FsBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FsBackend> = Arc::new(DirectoryFs::new(dir.path().join("data")));
        fs.init().await.unwrap();
        let config = StoreConfig::new(dir.path().join("data"));
        let sync = FsWatchSync::new(Arc::clone(&fs), &config);
        (dir, sync, fs)
    }

    fn created(fs: &Arc<dyn FsBackend>, rel: &str) -> RawChange {
        RawChange {
            kind: RawKind::Created,
            path: fs.root_path().join(rel),
        }
    }

    fn removed(fs: &Arc<dyn FsBackend>, rel: &str) -> RawChange {
        RawChange {
            kind: RawKind::Removed,
            path: fs.root_path().join(rel),
        }
    }

    #[tokio::test]
    async fn own_writes_are_suppressed() {
        let (_dir, sync, fs) = transport().await;
        fs.write_file(Path::new("settings"), b"{\"a\":1}\n")
            .await
            .unwrap();

        let outcome = sync.inner.classify(&created(&fs, "settings")).await;
        assert_eq!(outcome, Classified::Ignore);
    }

    #[tokio::test]
    async fn external_writes_are_reported() {
        let (_dir, sync, fs) = transport().await;
        std::fs::write(fs.root_path().join("settings"), b"external").unwrap();

        let outcome = sync.inner.classify(&created(&fs, "settings")).await;
        assert_eq!(outcome, Classified::Content(PathBuf::from("settings")));
    }

    #[tokio::test]
    async fn rewritten_files_are_reported() {
        let (_dir, sync, fs) = transport().await;
        fs.write_file(Path::new("settings"), b"mine").await.unwrap();
        std::fs::write(fs.root_path().join("settings"), b"theirs").unwrap();

        let outcome = sync.inner.classify(&created(&fs, "settings")).await;
        assert_eq!(outcome, Classified::Content(PathBuf::from("settings")));
    }

    #[tokio::test]
    async fn reserved_and_transient_names_are_ignored() {
        let (_dir, sync, fs) = transport().await;
        for rel in [
            "fs.lock",
            "~settings",
            "~~invoice~invoice",
            "~.tran/templates/x/config.json",
            ".git/HEAD",
            "nested/.DS_Store",
        ] {
            let outcome = sync.inner.classify(&created(&fs, rel)).await;
            assert_eq!(outcome, Classified::Ignore, "{rel}");
        }
    }

    #[tokio::test]
    async fn ignored_subtrees_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn FsBackend> = Arc::new(DirectoryFs::new(dir.path()));
        fs.init().await.unwrap();
        let config = StoreConfig::new(dir.path()).ignore_path("storage");
        let sync = FsWatchSync::new(Arc::clone(&fs), &config);

        std::fs::create_dir_all(dir.path().join("storage")).unwrap();
        std::fs::write(dir.path().join("storage/blob.bin"), b"x").unwrap();
        let outcome = sync.inner.classify(&created(&fs, "storage/blob.bin")).await;
        assert_eq!(outcome, Classified::Ignore);
    }

    #[tokio::test]
    async fn peer_markers_become_transaction_events() {
        let (_dir, sync, fs) = transport().await;
        let peer = layout::marker_name(std::process::id() + 1, "tx9");

        let begin = sync.inner.classify(&created(&fs, &peer)).await;
        assert_eq!(
            begin,
            Classified::Marker(SyncEvent::TransactionBegin { id: "tx9".into() })
        );

        let finish = sync.inner.classify(&removed(&fs, &peer)).await;
        assert_eq!(
            finish,
            Classified::Marker(SyncEvent::TransactionFinish { id: "tx9".into() })
        );
    }

    #[tokio::test]
    async fn own_markers_are_ignored() {
        let (_dir, sync, fs) = transport().await;
        let own = layout::marker_name(std::process::id(), "tx1");
        let outcome = sync.inner.classify(&created(&fs, &own)).await;
        assert_eq!(outcome, Classified::Ignore);
    }

    #[tokio::test]
    async fn external_removal_of_known_path_is_reported() {
        let (_dir, sync, fs) = transport().await;
        fs.write_file(Path::new("settings"), b"mine").await.unwrap();

        // Someone else deletes it: the mirror entry survives.
        std::fs::remove_file(fs.root_path().join("settings")).unwrap();
        let outcome = sync.inner.classify(&removed(&fs, "settings")).await;
        assert_eq!(outcome, Classified::Content(PathBuf::from("settings")));
    }

    #[tokio::test]
    async fn own_removal_is_suppressed() {
        let (_dir, sync, fs) = transport().await;
        fs.write_file(Path::new("settings"), b"mine").await.unwrap();
        fs.remove(Path::new("settings")).await.unwrap();

        let outcome = sync.inner.classify(&removed(&fs, "settings")).await;
        assert_eq!(outcome, Classified::Ignore);
    }

    #[tokio::test]
    async fn publish_creates_and_removes_marker() {
        let (_dir, sync, fs) = transport().await;
        let marker = layout::marker_name(std::process::id(), "tx42");

        sync.publish(&SyncEvent::TransactionBegin { id: "tx42".into() })
            .await
            .unwrap();
        assert!(fs.root_path().join(&marker).exists());

        sync.publish(&SyncEvent::TransactionFinish { id: "tx42".into() })
            .await
            .unwrap();
        assert!(!fs.root_path().join(&marker).exists());
    }

    #[tokio::test]
    async fn emit_prunes_dropped_subscribers() {
        let (_dir, sync, _fs) = transport().await;
        let mut keep = sync.subscribe();
        let gone = sync.subscribe();
        drop(gone);

        sync.inner.emit(SyncEvent::Reload { path: None });
        assert!(matches!(
            keep.recv().await,
            Some(SyncEvent::Reload { path: None })
        ));
        assert_eq!(sync.inner.subscribers.lock().len(), 1);
    }
}
