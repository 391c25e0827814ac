//! Strict FIFO execution lane for mutating operations.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

type ItemFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ItemJob = Box<dyn FnOnce(ItemSignal) -> Option<ItemFuture> + Send>;

enum ItemSignal {
    Run,
    Reject(StoreError),
}

struct QueueItem {
    enqueued_at: Instant,
    job: ItemJob,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    paused: bool,
    closed: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// A single-concurrency FIFO executor.
///
/// Every mutating store operation goes through one of these: items run
/// strictly in submission order, one at a time, and a failing item rejects
/// only its own caller. Items that sit unstarted past a deadline can be
/// swept out with [`OperationQueue::reject_timed_out`], and the whole lane
/// can be paused while a peer transaction holds the tree.
pub struct OperationQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OperationQueue")
            .field("pending", &state.items.len())
            .field("paused", &state.paused)
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Creates the queue and spawns its worker; must run inside a tokio
    /// runtime.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        let worker = tokio::spawn(Self::run_worker(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(shared: Arc<QueueShared>) {
        enum Next {
            Item(QueueItem),
            Wait,
            Exit(Vec<QueueItem>),
        }

        loop {
            let next = {
                let mut state = shared.state.lock();
                if state.closed {
                    Next::Exit(state.items.drain(..).collect())
                } else if state.paused {
                    Next::Wait
                } else {
                    match state.items.pop_front() {
                        Some(item) => Next::Item(item),
                        None => Next::Wait,
                    }
                }
            };
            match next {
                Next::Item(item) => {
                    if let Some(future) = (item.job)(ItemSignal::Run) {
                        future.await;
                    }
                }
                Next::Wait => shared.notify.notified().await,
                Next::Exit(leftover) => {
                    for item in leftover {
                        let _ = (item.job)(ItemSignal::Reject(StoreError::QueueClosed));
                    }
                    return;
                }
            }
        }
    }

    /// Enqueues `make_job` and resolves with its result once it has run.
    ///
    /// # Errors
    ///
    /// [`StoreError::QueueClosed`] when the queue is closed and
    /// [`StoreError::QueueTimeout`] when the item is swept out before it
    /// starts; otherwise whatever the job itself returns.
    pub fn push<T, Fut, F>(&self, make_job: F) -> impl Future<Output = StoreResult<T>> + Send + 'static
    where
        T: Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<StoreResult<T>>();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                let _ = tx.send(Err(StoreError::QueueClosed));
            } else {
                let job: ItemJob = Box::new(move |signal| match signal {
                    ItemSignal::Run => Some(Box::pin(async move {
                        let _ = tx.send(make_job().await);
                    })),
                    ItemSignal::Reject(err) => {
                        let _ = tx.send(Err(err));
                        None
                    }
                });
                state.items.push_back(QueueItem {
                    enqueued_at: Instant::now(),
                    job,
                });
            }
        }
        self.shared.notify.notify_one();
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(StoreError::QueueClosed),
            }
        }
    }

    /// Fails every item that has waited longer than `max_wait` without
    /// starting. Returns how many were rejected.
    pub fn reject_timed_out(&self, max_wait: Duration) -> usize {
        let stale = {
            let mut state = self.shared.state.lock();
            let mut stale = Vec::new();
            let mut kept = VecDeque::with_capacity(state.items.len());
            for item in state.items.drain(..) {
                if item.enqueued_at.elapsed() > max_wait {
                    stale.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            state.items = kept;
            stale
        };
        let rejected = stale.len();
        for item in stale {
            let waited_ms = item.enqueued_at.elapsed().as_millis() as u64;
            let _ = (item.job)(ItemSignal::Reject(StoreError::QueueTimeout { waited_ms }));
        }
        if rejected > 0 {
            warn!(target: "arbordb::queue", rejected, "rejected queue items past their wait deadline");
        }
        rejected
    }

    /// Stops starting new items until [`OperationQueue::resume`]. The item
    /// already running finishes normally.
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    /// Resumes starting items.
    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.notify.notify_one();
    }

    /// Number of items waiting to start.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Closes the queue: pending items are rejected and the worker exits
    /// after the in-flight item completes.
    pub async fn close(&self) {
        let leftover: Vec<QueueItem> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        for item in leftover {
            let _ = (item.job)(ItemSignal::Reject(StoreError::QueueClosed));
        }
        self.shared.notify.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.notify.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex as SyncMutex;

    use super::*;

    #[tokio::test]
    async fn runs_items_in_submission_order() {
        let queue = OperationQueue::new();
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..8 {
            let order = Arc::clone(&order);
            handles.push(queue.push(move || async move {
                // an early item yielding must not let later items overtake it
                tokio::task::yield_now().await;
                order.lock().push(index);
                Ok(index)
            }));
        }
        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), index);
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_rejects_only_its_own_caller() {
        let queue = OperationQueue::new();
        let failing = queue.push(|| async { Err::<(), _>(StoreError::invalid_operation("boom")) });
        let after = queue.push(|| async { Ok(7) });

        assert!(failing.await.is_err());
        assert_eq!(after.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn sweeps_items_past_their_deadline() {
        let queue = OperationQueue::new();
        let blocker = queue.push(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        let stuck = queue.push(|| async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.reject_timed_out(Duration::ZERO), 1);

        assert!(matches!(stuck.await, Err(StoreError::QueueTimeout { .. })));
        blocker.await.unwrap();
        assert_eq!(queue.reject_timed_out(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn pause_holds_items_until_resume() {
        let queue = OperationQueue::new();
        queue.pause();

        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let handle = queue.push(move || async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        queue.resume();
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_rejects_pending_and_later_pushes() {
        let queue = OperationQueue::new();
        queue.pause();
        let pending = queue.push(|| async { Ok(()) });

        queue.close().await;
        assert!(matches!(pending.await, Err(StoreError::QueueClosed)));

        let late = queue.push(|| async { Ok(()) });
        assert!(matches!(late.await, Err(StoreError::QueueClosed)));
    }
}
