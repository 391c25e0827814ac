//! The document store facade.
//!
//! Wires the pieces together: a filesystem backend, the persistence
//! engine, one FIFO queue for mutations, the change transport, and the
//! transaction manager. Reads are served from an in-memory cache snapshot
//! and never queue; every mutation runs as a queue item that takes the
//! cross-process lock, works on a private copy of the cache, and swaps it
//! in whole. Inbound sync events patch the cache the same way, so the
//! cache only ever shows committed states.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use arbordb_fs::{DirectoryFs, FsBackend, LOCK_FILE_NAME};

use crate::codec;
use crate::config::StoreConfig;
use crate::document::{deep_get, deep_set, etag_now, Document, DocumentSet, JsonMap, ID_FIELD};
use crate::error::{StoreError, StoreResult};
use crate::model::DocumentModel;
use crate::persistence::{with_lock, ExtensionResolver, Persistence, ResolverChain};
use crate::query::{compare_bodies, DefaultMatcher, Query, QueryMatcher, SortOrder, UpdateSpec};
use crate::queue::OperationQueue;
use crate::sync::{ChangeSync, DocRef, FsWatchSync, SyncEvent};
use crate::transaction::{apply, Applied, Transaction, TransactionManager, TxOperation};

/// Shared cache cell: cheap snapshot reads, whole-set swaps on mutation.
pub(crate) type CacheCell = Arc<RwLock<Arc<DocumentSet>>>;

/// What an external change did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalModificationKind {
    /// A document appeared.
    Insert,
    /// A document changed.
    Update,
    /// A document disappeared.
    Remove,
    /// The whole tree was re-read.
    Reload,
}

/// Notification that a peer process or a committed transaction changed
/// the store behind this instance's back.
#[derive(Debug, Clone)]
pub struct ExternalModification {
    /// What happened.
    pub kind: ExternalModificationKind,
    /// Affected entity set, absent for whole-tree reloads.
    pub entity_set: Option<String>,
    /// Affected document id, absent for whole-tree reloads.
    pub id: Option<String>,
}

/// Options for [`DocumentStore::update_with`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Insert the assigned fields as a fresh document when nothing
    /// matches.
    pub upsert: bool,
    /// Run the update inside this transaction.
    pub transaction: Option<Transaction>,
}

struct StoreInner {
    config: StoreConfig,
    model: Arc<DocumentModel>,
    fs: Arc<dyn FsBackend>,
    sync: Arc<dyn ChangeSync>,
    matcher: Arc<dyn QueryMatcher>,
    persistence: Persistence,
    resolvers: Arc<ResolverChain>,
    queue: Arc<OperationQueue>,
    cache: CacheCell,
    transactions: TransactionManager,
    remote_transactions: Mutex<HashSet<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ExternalModification>>>,
    compaction_scheduled: AtomicBool,
    closed: AtomicBool,
    marker_expiry: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreInner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::StoreClosed);
        }
        Ok(())
    }

    /// A queued live mutation: lock the tree, apply against a working copy
    /// of the cache, swap the copy in, then tell peers.
    fn mutate(
        self: Arc<Self>,
        op: TxOperation,
    ) -> impl Future<Output = StoreResult<Applied>> + Send + 'static {
        let queue = Arc::clone(&self.queue);
        queue.push(move || async move {
            self.ensure_open()?;
            let applied = with_lock(self.fs.as_ref(), || async {
                let mut docs = (**self.cache.read()).clone();
                let applied = apply(
                    &op,
                    &mut docs,
                    Some(&self.persistence),
                    self.matcher.as_ref(),
                    None,
                )
                .await?;
                *self.cache.write() = Arc::new(docs);
                Ok(applied)
            })
            .await?;
            self.publish_applied(&applied).await;
            Ok(applied)
        })
    }

    /// Announces a completed live mutation. Failures are logged, not
    /// propagated: the write itself has already landed.
    async fn publish_applied(&self, applied: &Applied) {
        let result = match applied {
            Applied::Inserted(doc) => self.publish_doc(doc, true).await,
            Applied::Updated(docs) => {
                let mut result = Ok(());
                for doc in docs {
                    result = result.and(self.publish_doc(doc, false).await);
                }
                result
            }
            Applied::Removed(docs) => {
                let mut result = Ok(());
                for doc in docs {
                    let event = SyncEvent::Remove {
                        doc: self.doc_ref(doc),
                    };
                    result = result.and(self.sync.publish(&event).await);
                }
                result
            }
        };
        if let Err(error) = result {
            warn!(target: "arbordb::store", error = %error, "failed to publish change");
        }
    }

    /// Documents above the configured wire size travel as a refresh
    /// pointing at the tree instead of in full.
    async fn publish_doc(&self, doc: &Document, inserted: bool) -> StoreResult<()> {
        let size = codec::to_line_json(&Value::Object(doc.body().clone()))
            .map(|line| line.len())
            .unwrap_or(usize::MAX);
        let event = if size >= self.config.message_size_limit {
            SyncEvent::Refresh {
                doc: self.doc_ref(doc),
            }
        } else if inserted {
            SyncEvent::Insert { doc: doc.clone() }
        } else {
            SyncEvent::Update { doc: doc.clone() }
        };
        self.sync.publish(&event).await
    }

    fn doc_ref(&self, doc: &Document) -> DocRef {
        let key = self
            .model
            .entity_set(doc.entity_set())
            .and_then(|set| set.public_key())
            .and_then(|field| doc.str_field(field))
            .unwrap_or_default()
            .to_string();
        DocRef {
            entity_set: doc.entity_set().to_string(),
            id: doc.id().unwrap_or_default().to_string(),
            key,
            folder_shortid: doc.folder_shortid().map(str::to_string),
        }
    }

    fn emit_external(
        &self,
        kind: ExternalModificationKind,
        entity_set: Option<&str>,
        id: Option<&str>,
    ) {
        let modification = ExternalModification {
            kind,
            entity_set: entity_set.map(str::to_string),
            id: id.map(str::to_string),
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(modification.clone()).is_ok());
    }

    // ---- inbound sync events -------------------------------------------

    /// Routes one inbound event. Transaction markers act on the queue
    /// immediately; everything else becomes a queue item so it serializes
    /// with local mutations, with completion watched from a side task.
    fn handle_sync(self: Arc<Self>, event: SyncEvent) {
        match event {
            SyncEvent::TransactionBegin { id } => self.pause_for_remote(id),
            SyncEvent::TransactionFinish { id } => self.finish_remote(&id),
            SyncEvent::Insert { doc } => {
                self.spawn_remote(move |inner| async move {
                    inner
                        .apply_remote_doc(doc, ExternalModificationKind::Insert)
                        .await
                });
            }
            SyncEvent::Update { doc } => {
                self.spawn_remote(move |inner| async move {
                    inner
                        .apply_remote_doc(doc, ExternalModificationKind::Update)
                        .await
                });
            }
            SyncEvent::Remove { doc } => {
                self.spawn_remote(move |inner| async move { inner.apply_remote_remove(&doc) });
            }
            SyncEvent::Refresh { doc } => {
                self.spawn_remote(move |inner| async move { inner.apply_remote_refresh(doc).await });
            }
            SyncEvent::Reload { path } => {
                self.spawn_remote(move |inner| async move { inner.apply_remote_reload(path).await });
            }
        }
    }

    /// Queues an inbound patch without waiting for it, so marker events
    /// can still pause and resume the queue it runs on.
    fn spawn_remote<F, Fut>(self: Arc<Self>, patch: F)
    where
        F: FnOnce(Arc<StoreInner>) -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self);
        let completion = self.queue.push(move || patch(inner));
        tokio::spawn(async move {
            if let Err(error) = completion.await {
                warn!(target: "arbordb::store", error = %error, "failed to apply synced change");
            }
        });
    }

    async fn apply_remote_doc(
        &self,
        doc: Document,
        kind: ExternalModificationKind,
    ) -> StoreResult<()> {
        let Some(id) = doc.id().map(str::to_string) else {
            return Ok(());
        };
        let entity_set = doc.entity_set().to_string();
        let mut docs = (**self.cache.read()).clone();
        match docs.find_by_id_mut(&entity_set, &id) {
            // Only a strictly newer cached stamp blocks the incoming copy;
            // a same-millisecond tie goes to the peer.
            Some(existing) if existing.etag() > doc.etag() => return Ok(()),
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        *self.cache.write() = Arc::new(docs);
        self.emit_external(kind, Some(&entity_set), Some(&id));
        Ok(())
    }

    fn apply_remote_remove(&self, doc: &DocRef) -> StoreResult<()> {
        let mut docs = (**self.cache.read()).clone();
        if docs.remove_by_id(&doc.entity_set, &doc.id).is_none() {
            return Ok(());
        }
        *self.cache.write() = Arc::new(docs);
        self.emit_external(
            ExternalModificationKind::Remove,
            Some(&doc.entity_set),
            Some(&doc.id),
        );
        Ok(())
    }

    /// Re-reads one document from disk; peers publish this instead of the
    /// document itself when it is too large for the wire.
    async fn apply_remote_refresh(&self, doc: DocRef) -> StoreResult<()> {
        let snapshot = Arc::clone(&self.cache.read());
        let key = (!doc.key.is_empty()).then_some(doc.key.as_str());
        let reloaded = self
            .persistence
            .reload(
                &doc.entity_set,
                &doc.id,
                key,
                doc.folder_shortid.as_deref(),
                &snapshot,
            )
            .await?;

        let mut docs = (**self.cache.read()).clone();
        let kind = match reloaded {
            Some(mut fresh) => {
                fresh.set_etag(etag_now());
                match docs.find_by_id_mut(&doc.entity_set, &doc.id) {
                    Some(slot) => *slot = fresh,
                    None => docs.push(fresh),
                }
                ExternalModificationKind::Update
            }
            None => {
                docs.remove_by_id(&doc.entity_set, &doc.id);
                ExternalModificationKind::Remove
            }
        };
        *self.cache.write() = Arc::new(docs);
        self.emit_external(kind, Some(&doc.entity_set), Some(&doc.id));
        Ok(())
    }

    async fn apply_remote_reload(&self, path: Option<PathBuf>) -> StoreResult<()> {
        debug!(target: "arbordb::store", path = ?path, "reloading after external changes");
        let loaded = with_lock(self.fs.as_ref(), || async { self.persistence.load().await }).await?;
        *self.cache.write() = Arc::new(loaded);
        self.emit_external(ExternalModificationKind::Reload, None, None);
        Ok(())
    }

    /// A peer opened a transaction: hold our mutations until its marker
    /// goes away, or until the marker expiry elapses in case the peer
    /// died without cleaning up.
    fn pause_for_remote(self: Arc<Self>, id: String) {
        debug!(target: "arbordb::store", transaction = %id, "pausing for peer transaction");
        self.remote_transactions.lock().insert(id.clone());
        self.queue.pause();

        let weak = Arc::downgrade(&self);
        let expiry = self.marker_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.remote_transactions.lock().remove(&id) {
                warn!(
                    target: "arbordb::store",
                    transaction = %id,
                    "peer transaction never finished, resuming queue"
                );
                inner.maybe_resume();
            }
        });
    }

    fn finish_remote(&self, id: &str) {
        self.remote_transactions.lock().remove(id);
        self.maybe_resume();
    }

    fn maybe_resume(&self) {
        if self.remote_transactions.lock().is_empty() {
            self.queue.resume();
        }
    }

    // ---- background maintenance ----------------------------------------

    /// Queues a compaction pass unless one is already waiting.
    fn schedule_compaction(self: &Arc<Self>) {
        if !self.config.compaction_enabled || self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.compaction_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let completion = self.queue.push(move || async move {
            inner.compaction_scheduled.store(false, Ordering::SeqCst);
            inner.ensure_open()?;
            with_lock(inner.fs.as_ref(), || async {
                let snapshot = Arc::clone(&inner.cache.read());
                inner.persistence.compact(&snapshot).await
            })
            .await
        });
        tokio::spawn(async move {
            if let Err(error) = completion.await {
                warn!(target: "arbordb::store", error = %error, "compaction failed");
            }
        });
    }
}

impl fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreInner")
            .field("root", &self.fs.root_path())
            .field("documents", &self.cache.read().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn run_sync_pump(weak: Weak<StoreInner>, mut events: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_sync(event);
    }
}

async fn run_sweeper(weak: Weak<StoreInner>, sweep_interval: Duration, wait_timeout: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.queue.reject_timed_out(wait_timeout);
    }
}

async fn run_compaction_loop(weak: Weak<StoreInner>, interval: Duration) {
    // the first tick fires immediately, which doubles as the compaction
    // pass at startup
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.schedule_compaction();
    }
}

/// Configures and opens a [`DocumentStore`].
#[derive(Debug)]
pub struct StoreBuilder {
    config: StoreConfig,
    model: DocumentModel,
    fs: Option<Arc<dyn FsBackend>>,
    sync: Option<Arc<dyn ChangeSync>>,
    matcher: Arc<dyn QueryMatcher>,
}

impl StoreBuilder {
    /// Replaces the filesystem backend (default: [`DirectoryFs`] rooted at
    /// the configured data directory).
    #[must_use]
    pub fn fs_backend(mut self, fs: Arc<dyn FsBackend>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Replaces the change transport (default: [`FsWatchSync`]).
    #[must_use]
    pub fn change_sync(mut self, sync: Arc<dyn ChangeSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Replaces the query matcher (default: [`DefaultMatcher`]).
    #[must_use]
    pub fn query_matcher(mut self, matcher: Arc<dyn QueryMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Opens the store: recovers interrupted work, loads the tree into
    /// the cache, arms the change transport, and starts the background
    /// tasks.
    pub async fn open(self) -> StoreResult<DocumentStore> {
        let config = self.config;
        let model = Arc::new(self.model);
        let fs = self.fs.unwrap_or_else(|| {
            Arc::new(DirectoryFs::with_lock_options(
                config.data_directory.clone(),
                config.lock,
            ))
        });
        fs.init().await?;
        let sync = self
            .sync
            .unwrap_or_else(|| Arc::new(FsWatchSync::new(Arc::clone(&fs), &config)));

        let resolvers = Arc::new(ResolverChain::default());
        let persistence = Persistence::new(
            Arc::clone(&fs),
            Arc::clone(&model),
            Arc::clone(&resolvers),
            config.rename_retries,
            config.corrupt_alert_threshold,
        );
        let queue = Arc::new(OperationQueue::new());
        let cache: CacheCell = Arc::new(RwLock::new(Arc::new(DocumentSet::for_model(&model))));
        let marker_expiry = config.lock.stale_after * 2;
        let transactions = TransactionManager::new(
            Arc::clone(&fs),
            persistence.clone(),
            Arc::clone(&sync),
            Arc::clone(&self.matcher),
            Arc::clone(&queue),
            Arc::clone(&cache),
            marker_expiry,
        );

        // settle the tree before anything can observe it
        with_lock(fs.as_ref(), || async {
            transactions.recover().await?;
            let loaded = persistence.load().await?;
            info!(
                target: "arbordb::store",
                documents = loaded.len(),
                root = %fs.root_path().display(),
                "store loaded"
            );
            *cache.write() = Arc::new(loaded);
            Ok(())
        })
        .await?;

        let inner = Arc::new(StoreInner {
            model,
            fs,
            matcher: self.matcher,
            persistence,
            resolvers,
            queue,
            cache,
            transactions,
            remote_transactions: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(Vec::new()),
            compaction_scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            marker_expiry,
            tasks: Mutex::new(Vec::new()),
            sync,
            config,
        });

        // subscribe before arming so no event can slip past
        let events = inner.sync.subscribe();
        inner.sync.init().await?;

        let mut tasks = vec![
            tokio::spawn(run_sync_pump(Arc::downgrade(&inner), events)),
            tokio::spawn(run_sweeper(
                Arc::downgrade(&inner),
                inner.config.queue_sweep_interval,
                inner.config.queue_wait_timeout,
            )),
        ];
        if inner.config.compaction_enabled {
            tasks.push(tokio::spawn(run_compaction_loop(
                Arc::downgrade(&inner),
                inner.config.compaction_interval,
            )));
        }
        *inner.tasks.lock() = tasks;

        Ok(DocumentStore { inner })
    }
}

/// An embedded document store over a directory tree.
///
/// Open one with [`DocumentStore::builder`]. All methods take `&self`;
/// share the store by reference or inside an [`Arc`].
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Starts building a store over `config` and `model`.
    #[must_use]
    pub fn builder(config: StoreConfig, model: DocumentModel) -> StoreBuilder {
        StoreBuilder {
            config,
            model,
            fs: None,
            sync: None,
            matcher: Arc::new(DefaultMatcher),
        }
    }

    /// Opens a store with the default backend, transport, and matcher.
    pub async fn open(config: StoreConfig, model: DocumentModel) -> StoreResult<Self> {
        Self::builder(config, model).open().await
    }

    /// The entity model this store was opened with.
    #[must_use]
    pub fn model(&self) -> &DocumentModel {
        &self.inner.model
    }

    /// The directory holding the document tree.
    #[must_use]
    pub fn data_directory(&self) -> &Path {
        self.inner.fs.root_path()
    }

    /// Snapshot of every cached document.
    #[must_use]
    pub fn documents(&self) -> Arc<DocumentSet> {
        Arc::clone(&self.inner.cache.read())
    }

    /// Registers a resolver consulted for document property file
    /// extensions, ahead of the extensions declared in the model.
    pub fn add_file_extension_resolver(&self, resolver: ExtensionResolver) {
        self.inner.resolvers.register(resolver);
    }

    /// Notifications about changes made by peer processes.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExternalModification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    // ---- reads ---------------------------------------------------------

    /// Starts a query against `entity_set`.
    #[must_use]
    pub fn find(&self, entity_set: impl Into<String>, query: Query) -> FindQuery {
        FindQuery {
            inner: Arc::clone(&self.inner),
            entity_set: entity_set.into(),
            query,
            transaction: None,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            fields: None,
        }
    }

    // ---- mutations -----------------------------------------------------

    /// Inserts a document, assigning `_id` when the body has none, and
    /// returns the stored copy.
    pub async fn insert(&self, entity_set: &str, body: Value) -> StoreResult<Document> {
        self.insert_inner(entity_set, body, None).await
    }

    /// [`DocumentStore::insert`] inside a transaction.
    pub async fn insert_in(
        &self,
        entity_set: &str,
        body: Value,
        transaction: &Transaction,
    ) -> StoreResult<Document> {
        self.insert_inner(entity_set, body, Some(transaction)).await
    }

    async fn insert_inner(
        &self,
        entity_set: &str,
        body: Value,
        transaction: Option<&Transaction>,
    ) -> StoreResult<Document> {
        self.inner.ensure_open()?;
        self.inner.model.require(entity_set)?;
        let Value::Object(map) = body else {
            return Err(StoreError::invalid_operation(
                "document body must be a JSON object",
            ));
        };
        let op = TxOperation::Insert {
            doc: Document::new(entity_set, map),
        };
        let applied = match transaction {
            Some(tx) => tx.stage(Arc::clone(&self.inner.matcher), op).await?,
            None => Arc::clone(&self.inner).mutate(op).await?,
        };
        match applied {
            Applied::Inserted(doc) => Ok(doc),
            _ => Err(StoreError::invalid_operation(
                "insert produced no document",
            )),
        }
    }

    /// Assigns fields on every document matching `query`; returns how
    /// many matched.
    pub async fn update(
        &self,
        entity_set: &str,
        query: Query,
        spec: UpdateSpec,
    ) -> StoreResult<usize> {
        self.update_with(entity_set, query, spec, UpdateOptions::default())
            .await
    }

    /// [`DocumentStore::update`] with upsert and transaction options.
    pub async fn update_with(
        &self,
        entity_set: &str,
        query: Query,
        spec: UpdateSpec,
        options: UpdateOptions,
    ) -> StoreResult<usize> {
        self.inner.ensure_open()?;
        self.inner.model.require(entity_set)?;
        let op = TxOperation::Update {
            entity_set: entity_set.to_string(),
            query,
            spec: spec.clone(),
        };
        let applied = match &options.transaction {
            Some(tx) => tx.stage(Arc::clone(&self.inner.matcher), op).await?,
            None => Arc::clone(&self.inner).mutate(op).await?,
        };
        let updated = match applied {
            Applied::Updated(docs) => docs.len(),
            _ => 0,
        };
        if updated == 0 && options.upsert {
            let body = Value::Object(spec.to_body());
            match &options.transaction {
                Some(tx) => self.insert_in(entity_set, body, tx).await?,
                None => self.insert(entity_set, body).await?,
            };
            return Ok(1);
        }
        Ok(updated)
    }

    /// Removes every document matching `query`; returns how many went.
    pub async fn remove(&self, entity_set: &str, query: Query) -> StoreResult<usize> {
        self.remove_inner(entity_set, query, None).await
    }

    /// [`DocumentStore::remove`] inside a transaction.
    pub async fn remove_in(
        &self,
        entity_set: &str,
        query: Query,
        transaction: &Transaction,
    ) -> StoreResult<usize> {
        self.remove_inner(entity_set, query, Some(transaction)).await
    }

    async fn remove_inner(
        &self,
        entity_set: &str,
        query: Query,
        transaction: Option<&Transaction>,
    ) -> StoreResult<usize> {
        self.inner.ensure_open()?;
        self.inner.model.require(entity_set)?;
        let op = TxOperation::Remove {
            entity_set: entity_set.to_string(),
            query,
        };
        let applied = match transaction {
            Some(tx) => tx.stage(Arc::clone(&self.inner.matcher), op).await?,
            None => Arc::clone(&self.inner).mutate(op).await?,
        };
        match applied {
            Applied::Removed(docs) => Ok(docs.len()),
            _ => Ok(0),
        }
    }

    // ---- transactions --------------------------------------------------

    /// Opens a transaction. Peer processes pause their mutations until it
    /// finishes one way or the other.
    pub async fn begin_transaction(&self) -> StoreResult<Transaction> {
        self.inner.ensure_open()?;
        self.inner.transactions.begin().await
    }

    /// Commits `transaction`, making its staged changes durable and
    /// visible.
    pub async fn commit_transaction(&self, transaction: &Transaction) -> StoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.transactions.commit(transaction).await
    }

    /// Discards `transaction` and everything staged in it.
    pub async fn rollback_transaction(&self, transaction: &Transaction) -> StoreResult<()> {
        self.inner.ensure_open()?;
        self.inner.transactions.rollback(transaction).await
    }

    // ---- maintenance ---------------------------------------------------

    /// Deletes every document and resets the cache. The lock file stays.
    pub async fn drop_data(&self) -> StoreResult<()> {
        self.inner.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .push(move || async move {
                inner.ensure_open()?;
                with_lock(inner.fs.as_ref(), || async {
                    for name in inner.fs.list(Path::new("")).await? {
                        if name == LOCK_FILE_NAME {
                            continue;
                        }
                        inner.fs.remove(Path::new(&name)).await?;
                    }
                    Ok(())
                })
                .await?;
                *inner.cache.write() = Arc::new(DocumentSet::for_model(&inner.model));
                Ok(())
            })
            .await
    }

    /// Closes the store: drains the queue, stops the transport and the
    /// background tasks. Reads keep working; mutations fail from here on.
    pub async fn close(&self) -> StoreResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.queue.close().await;
        self.inner.sync.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!(target: "arbordb::store", "store closed");
        Ok(())
    }
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Drop for DocumentStore {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.sync.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// A configured query, executed against a cache snapshot.
///
/// Built by [`DocumentStore::find`]; chain modifiers, then finish with
/// [`FindQuery::to_vec`], [`FindQuery::first`], or [`FindQuery::count`].
#[derive(Debug)]
pub struct FindQuery {
    inner: Arc<StoreInner>,
    entity_set: String,
    query: Query,
    transaction: Option<Transaction>,
    sort: Vec<SortOrder>,
    skip: usize,
    limit: Option<usize>,
    fields: Option<Vec<String>>,
}

impl FindQuery {
    /// Reads from the transaction's staged view instead of the live
    /// cache.
    #[must_use]
    pub fn in_transaction(mut self, transaction: &Transaction) -> Self {
        self.transaction = Some(transaction.clone());
        self
    }

    /// Adds a sort key; earlier keys win.
    #[must_use]
    pub fn sort_by(mut self, order: SortOrder) -> Self {
        self.sort.push(order);
        self
    }

    /// Skips the first `count` documents after sorting.
    #[must_use]
    pub fn skip(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    /// Caps the number of returned documents.
    #[must_use]
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }

    /// Projects each result down to the listed dotted paths plus `_id`.
    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    fn snapshot(&self) -> StoreResult<Arc<DocumentSet>> {
        self.inner.model.require(&self.entity_set)?;
        match &self.transaction {
            Some(tx) => tx.documents(),
            None => Ok(Arc::clone(&self.inner.cache.read())),
        }
    }

    /// All matching documents, in order.
    pub fn to_vec(&self) -> StoreResult<Vec<Document>> {
        let snapshot = self.snapshot()?;
        let mut matched: Vec<&Document> = snapshot
            .documents(&self.entity_set)
            .iter()
            .filter(|doc| self.inner.matcher.matches(doc, &self.query))
            .collect();
        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                self.sort
                    .iter()
                    .map(|order| compare_bodies(a.body(), b.body(), order))
                    .find(|ordering| *ordering != CmpOrdering::Equal)
                    .unwrap_or(CmpOrdering::Equal)
            });
        }
        let selected = matched.into_iter().skip(self.skip);
        let docs: Vec<Document> = match self.limit {
            Some(limit) => selected.take(limit).cloned().collect(),
            None => selected.cloned().collect(),
        };
        Ok(match &self.fields {
            Some(fields) => docs.iter().map(|doc| project(doc, fields)).collect(),
            None => docs,
        })
    }

    /// The first matching document under the current sort.
    pub fn first(&self) -> StoreResult<Option<Document>> {
        let snapshot = self.snapshot()?;
        // cheap path: no sort means any match will do
        if self.sort.is_empty() {
            let found = snapshot
                .documents(&self.entity_set)
                .iter()
                .filter(|doc| self.inner.matcher.matches(doc, &self.query))
                .nth(self.skip)
                .cloned();
            return Ok(found.map(|doc| match &self.fields {
                Some(fields) => project(&doc, fields),
                None => doc,
            }));
        }
        Ok(self.to_vec()?.into_iter().next())
    }

    /// Number of documents matching the query, before skip and limit.
    pub fn count(&self) -> StoreResult<usize> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .documents(&self.entity_set)
            .iter()
            .filter(|doc| self.inner.matcher.matches(doc, &self.query))
            .count())
    }
}

/// Keeps the listed dotted paths plus `_id`.
fn project(doc: &Document, fields: &[String]) -> Document {
    let mut body = JsonMap::new();
    if let Some(id) = doc.id() {
        body.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }
    for field in fields {
        if let Some(value) = deep_get(doc.body(), field) {
            deep_set(&mut body, field, value.clone());
        }
    }
    Document::with_etag(doc.entity_set(), body, doc.etag())
}
