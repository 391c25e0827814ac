//! Cross-process transactions.
//!
//! A transaction clones the cache as its private staged view, records
//! every mutation, and replays them at commit against a staging copy of
//! the tree. The staging directory moves through the same two-phase
//! naming as document writes (`~~.tran` while filling, `~.tran` once
//! consistent, then published over the root), so a crash at any point
//! leaves either the old tree or a completable consistent copy. A marker
//! file in the root tells peer processes to pause their queues for the
//! transaction's lifetime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use arbordb_fs::{FsBackend, FsError};

use crate::document::{etag_now, uid, Document, DocumentSet};
use crate::error::{StoreError, StoreResult};
use crate::layout;
use crate::persistence::{copy_tree, with_lock, Persistence};
use crate::query::{Query, QueryMatcher, UpdateSpec};
use crate::queue::OperationQueue;
use crate::store::CacheCell;
use crate::sync::{ChangeSync, SyncEvent};

/// A recorded mutation, applied to the staged view when issued and
/// replayed against the staging tree at commit.
#[derive(Debug, Clone)]
pub(crate) enum TxOperation {
    Insert {
        doc: Document,
    },
    Update {
        entity_set: String,
        query: Query,
        spec: UpdateSpec,
    },
    Remove {
        entity_set: String,
        query: Query,
    },
}

/// What an applied operation did, with the affected document copies.
#[derive(Debug)]
pub(crate) enum Applied {
    Inserted(Document),
    Updated(Vec<Document>),
    Removed(Vec<Document>),
}

/// Applies one operation to `docs`, persisting through `persistence` when
/// given (live mutations and commit replay) and recording the touched
/// `(entity set, id)` pairs when asked (commit replay only).
pub(crate) async fn apply(
    op: &TxOperation,
    docs: &mut DocumentSet,
    persistence: Option<&Persistence>,
    matcher: &dyn QueryMatcher,
    mut touched: Option<&mut HashSet<(String, String)>>,
) -> StoreResult<Applied> {
    match op {
        TxOperation::Insert { doc } => {
            let mut doc = doc.clone();
            let id = doc.ensure_id();
            doc.touch();
            if let Some(persistence) = persistence {
                persistence.insert(&doc, docs).await?;
            }
            if let Some(touched) = touched.as_deref_mut() {
                touched.insert((doc.entity_set().to_string(), id));
            }
            docs.push(doc.clone());
            Ok(Applied::Inserted(doc))
        }
        TxOperation::Update {
            entity_set,
            query,
            spec,
        } => {
            let ids = matched_ids(docs, entity_set, query, matcher);
            let mut updated = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(original) = docs.find_by_id(entity_set, &id).cloned() else {
                    continue;
                };
                let mut next = original.clone();
                spec.apply(next.body_mut());
                next.touch();
                if let Some(persistence) = persistence {
                    persistence.update(&next, &original, docs).await?;
                }
                if let Some(touched) = touched.as_deref_mut() {
                    touched.insert((entity_set.clone(), id.clone()));
                }
                if let Some(slot) = docs.find_by_id_mut(entity_set, &id) {
                    *slot = next.clone();
                }
                updated.push(next);
            }
            Ok(Applied::Updated(updated))
        }
        TxOperation::Remove { entity_set, query } => {
            let ids = matched_ids(docs, entity_set, query, matcher);
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(doc) = docs.find_by_id(entity_set, &id).cloned() else {
                    continue;
                };
                if let Some(persistence) = persistence {
                    persistence.remove(&doc, docs).await?;
                }
                if let Some(touched) = touched.as_deref_mut() {
                    touched.insert((entity_set.clone(), id.clone()));
                }
                docs.remove_by_id(entity_set, &id);
                removed.push(doc);
            }
            Ok(Applied::Removed(removed))
        }
    }
}

fn matched_ids(
    docs: &DocumentSet,
    entity_set: &str,
    query: &Query,
    matcher: &dyn QueryMatcher,
) -> Vec<String> {
    docs.documents(entity_set)
        .iter()
        .filter(|doc| matcher.matches(doc, query))
        .filter_map(|doc| doc.id().map(str::to_string))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct TranInner {
    id: String,
    queue: OperationQueue,
    staged: Mutex<Arc<DocumentSet>>,
    operations: Mutex<Vec<TxOperation>>,
    begin_time: u64,
    state: Mutex<TxState>,
}

impl TranInner {
    fn ensure_active(&self) -> StoreResult<()> {
        match *self.state.lock() {
            TxState::Active => Ok(()),
            TxState::Committed => Err(StoreError::TransactionClosed { state: "committed" }),
            TxState::RolledBack => Err(StoreError::TransactionClosed {
                state: "rolled back",
            }),
        }
    }

    fn set_state(&self, state: TxState) {
        *self.state.lock() = state;
    }
}

/// Handle to an open transaction. Clones share the same transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    inner: Arc<TranInner>,
}

impl Transaction {
    fn open(staged: Arc<DocumentSet>) -> Self {
        Self {
            inner: Arc::new(TranInner {
                id: uid(16),
                queue: OperationQueue::new(),
                staged: Mutex::new(staged),
                operations: Mutex::new(Vec::new()),
                begin_time: etag_now(),
                state: Mutex::new(TxState::Active),
            }),
        }
    }

    /// Unique id of this transaction, also embedded in its marker file.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Snapshot of the staged view, for reads scoped to this transaction.
    pub(crate) fn documents(&self) -> StoreResult<Arc<DocumentSet>> {
        self.inner.ensure_active()?;
        Ok(Arc::clone(&self.inner.staged.lock()))
    }

    /// Runs `op` on the transaction's private queue: applies it to the
    /// staged view and records it for replay at commit.
    pub(crate) fn stage(
        &self,
        matcher: Arc<dyn QueryMatcher>,
        op: TxOperation,
    ) -> impl std::future::Future<Output = StoreResult<Applied>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        self.inner.queue.push(move || async move {
            inner.ensure_active()?;
            let mut staged = (**inner.staged.lock()).clone();
            let applied = apply(&op, &mut staged, None, matcher.as_ref(), None).await?;
            *inner.staged.lock() = Arc::new(staged);
            inner.operations.lock().push(op);
            Ok(applied)
        })
    }
}

/// Drives transaction begin, commit, rollback, and crash recovery.
///
/// Begin and commit run on the store's main queue and hold the
/// cross-process lock, so at most one commit dance happens per tree at a
/// time and the fixed staging names never collide.
#[derive(Debug, Clone)]
pub(crate) struct TransactionManager {
    fs: Arc<dyn FsBackend>,
    persistence: Persistence,
    sync: Arc<dyn ChangeSync>,
    matcher: Arc<dyn QueryMatcher>,
    queue: Arc<OperationQueue>,
    cache: CacheCell,
    marker_expiry: Duration,
}

impl TransactionManager {
    pub(crate) fn new(
        fs: Arc<dyn FsBackend>,
        persistence: Persistence,
        sync: Arc<dyn ChangeSync>,
        matcher: Arc<dyn QueryMatcher>,
        queue: Arc<OperationQueue>,
        cache: CacheCell,
        marker_expiry: Duration,
    ) -> Self {
        Self {
            fs,
            persistence,
            sync,
            matcher,
            queue,
            cache,
            marker_expiry,
        }
    }

    /// Opens a transaction: snapshots the cache under the lock and
    /// announces the marker that pauses peer queues.
    pub(crate) async fn begin(&self) -> StoreResult<Transaction> {
        let mgr = self.clone();
        self.queue
            .push(move || async move {
                let tx = with_lock(mgr.fs.as_ref(), || async {
                    let tx = Transaction::open(Arc::clone(&mgr.cache.read()));
                    mgr.sync
                        .publish(&SyncEvent::TransactionBegin {
                            id: tx.id().to_string(),
                        })
                        .await?;
                    Ok(tx)
                })
                .await
                .map_err(|err| match err {
                    StoreError::Fs(source @ FsError::LockTimeout { .. }) => {
                        StoreError::TransactionStartTimeout { source }
                    }
                    other => other,
                })?;
                debug!(target: "arbordb::tran", id = %tx.id(), "transaction open");
                Ok(tx)
            })
            .await
    }

    /// Commits: replays the recorded operations against a staging copy of
    /// the tree, checks for conflicting commits since begin, and publishes
    /// the staging directory over the root.
    pub(crate) async fn commit(&self, tx: &Transaction) -> StoreResult<()> {
        tx.inner.ensure_active()?;
        let mgr = self.clone();
        let inner = Arc::clone(&tx.inner);
        self.queue
            .push(move || async move {
                inner.ensure_active()?;
                let operations = inner.operations.lock().clone();
                let outcome = with_lock(mgr.fs.as_ref(), || async {
                    let replayed = mgr.replay(inner.begin_time, &operations).await;
                    // Both staging directories go away no matter how the
                    // replay ended; a failed commit must leave no trace.
                    let inflight = mgr
                        .fs
                        .remove(Path::new(layout::TRAN_STAGING_INFLIGHT))
                        .await;
                    let consistent = mgr
                        .fs
                        .remove(Path::new(layout::TRAN_STAGING_CONSISTENT))
                        .await;
                    let replayed = replayed?;
                    inflight?;
                    consistent?;
                    Ok(replayed)
                })
                .await;
                match outcome {
                    Ok(replayed) => {
                        *mgr.cache.write() = Arc::new(replayed);
                        inner.set_state(TxState::Committed);
                        // The tree is already published; announcement
                        // failures cannot unwind it. Peers stuck on the
                        // marker recover through expiry.
                        let reload = mgr.sync.publish(&SyncEvent::Reload { path: None }).await;
                        let finish = mgr
                            .sync
                            .publish(&SyncEvent::TransactionFinish {
                                id: inner.id.clone(),
                            })
                            .await;
                        if let Err(publish_err) = reload.and(finish) {
                            warn!(
                                target: "arbordb::tran",
                                id = %inner.id,
                                error = %publish_err,
                                "commit landed but its announcement failed"
                            );
                        }
                        debug!(target: "arbordb::tran", id = %inner.id, "transaction committed");
                        Ok(())
                    }
                    Err(err) => {
                        // The transaction stays open so the caller can
                        // still roll back; peers resume right away.
                        if let Err(publish_err) = mgr
                            .sync
                            .publish(&SyncEvent::TransactionFinish {
                                id: inner.id.clone(),
                            })
                            .await
                        {
                            warn!(
                                target: "arbordb::tran",
                                error = %publish_err,
                                "failed to publish transaction finish"
                            );
                        }
                        Err(err)
                    }
                }
            })
            .await
    }

    /// Discards the transaction. Any staging directories found under the
    /// lock are abandoned leftovers and are removed.
    pub(crate) async fn rollback(&self, tx: &Transaction) -> StoreResult<()> {
        tx.inner.ensure_active()?;
        let mgr = self.clone();
        let inner = Arc::clone(&tx.inner);
        self.queue
            .push(move || async move {
                inner.ensure_active()?;
                with_lock(mgr.fs.as_ref(), || async {
                    mgr.fs
                        .remove(Path::new(layout::TRAN_STAGING_INFLIGHT))
                        .await?;
                    mgr.fs
                        .remove(Path::new(layout::TRAN_STAGING_CONSISTENT))
                        .await?;
                    Ok(())
                })
                .await?;
                inner.set_state(TxState::RolledBack);
                if let Err(publish_err) = mgr
                    .sync
                    .publish(&SyncEvent::TransactionFinish {
                        id: inner.id.clone(),
                    })
                    .await
                {
                    warn!(
                        target: "arbordb::tran",
                        id = %inner.id,
                        error = %publish_err,
                        "failed to publish transaction finish"
                    );
                }
                debug!(target: "arbordb::tran", id = %inner.id, "transaction rolled back");
                Ok(())
            })
            .await
    }

    /// Finishes whatever an interrupted commit left behind and prunes
    /// expired markers. The caller holds the cross-process lock.
    pub(crate) async fn recover(&self) -> StoreResult<()> {
        if self
            .fs
            .exists(Path::new(layout::TRAN_STAGING_CONSISTENT))
            .await?
        {
            debug!(target: "arbordb::tran", "completing interrupted transaction publish");
            self.publish_staging().await?;
        }
        self.fs
            .remove(Path::new(layout::TRAN_STAGING_INFLIGHT))
            .await?;

        for name in self.fs.list(Path::new("")).await? {
            if layout::parse_marker(&name).is_none() {
                continue;
            }
            let path = PathBuf::from(&name);
            let Ok(stat) = self.fs.stat(&path).await else {
                continue;
            };
            let expired = stat
                .modified
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > self.marker_expiry);
            if expired {
                warn!(target: "arbordb::tran", marker = %name, "removing expired transaction marker");
                self.fs.remove(&path).await?;
            }
        }
        Ok(())
    }

    /// Builds the staging tree, replays the operations into it, and takes
    /// it through consistent naming to publication. Returns the document
    /// set the cache should swap to.
    async fn replay(
        &self,
        begin_time: u64,
        operations: &[TxOperation],
    ) -> StoreResult<DocumentSet> {
        // Leftover staging from a crashed peer commit; the lock guarantees
        // nobody is mid-dance right now.
        self.fs
            .remove(Path::new(layout::TRAN_STAGING_INFLIGHT))
            .await?;
        self.fs
            .remove(Path::new(layout::TRAN_STAGING_CONSISTENT))
            .await?;

        copy_tree(
            self.fs.as_ref(),
            Path::new(""),
            Path::new(layout::TRAN_STAGING_INFLIGHT),
            &|name: &str| layout::is_reserved(name) || name.starts_with('~'),
        )
        .await?;

        let snapshot = Arc::clone(&self.cache.read());
        let mut replayed = (*snapshot).clone();
        let staging = self.persistence.scoped(layout::TRAN_STAGING_INFLIGHT);
        let mut touched = HashSet::new();
        for op in operations {
            apply(
                op,
                &mut replayed,
                Some(&staging),
                self.matcher.as_ref(),
                Some(&mut touched),
            )
            .await?;
        }

        // Conflict: a touched document whose live stamp moved past begin
        // and does not match what the replay produced.
        for (entity_set, id) in &touched {
            let Some(committed) = snapshot.find_by_id(entity_set, id) else {
                continue;
            };
            if committed.etag() > begin_time {
                let unchanged = replayed
                    .find_by_id(entity_set, id)
                    .is_some_and(|doc| doc.etag() == committed.etag());
                if !unchanged {
                    warn!(
                        target: "arbordb::tran",
                        entity_set = %entity_set,
                        id = %id,
                        "transaction conflict"
                    );
                    return Err(StoreError::transaction_conflict(
                        entity_set.clone(),
                        id.clone(),
                    ));
                }
            }
        }

        self.fs
            .rename(
                Path::new(layout::TRAN_STAGING_INFLIGHT),
                Path::new(layout::TRAN_STAGING_CONSISTENT),
            )
            .await?;
        self.publish_staging().await?;
        Ok(replayed)
    }

    /// Replaces the live tree with the consistent staging directory.
    async fn publish_staging(&self) -> StoreResult<()> {
        for name in self.fs.list(Path::new("")).await? {
            if layout::is_reserved(&name) {
                continue;
            }
            self.fs.remove(Path::new(&name)).await?;
        }
        copy_tree(
            self.fs.as_ref(),
            Path::new(layout::TRAN_STAGING_CONSISTENT),
            Path::new(""),
            &|_: &str| false,
        )
        .await?;
        self.fs
            .remove(Path::new(layout::TRAN_STAGING_CONSISTENT))
            .await?;
        Ok(())
    }
}
