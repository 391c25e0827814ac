//! A hand-driven change transport.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use arbordb_core::{ChangeSync, SyncEvent, SyncFuture};

/// Change transport for tests: records everything the store publishes
/// and lets the test inject inbound events as if a peer had sent them.
#[derive(Debug, Default)]
pub struct ManualSync {
    published: Mutex<Vec<SyncEvent>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl ManualSync {
    /// Delivers `event` to every subscriber, as the watcher would.
    pub fn inject(&self, event: SyncEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<SyncEvent> {
        self.published.lock().clone()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl ChangeSync for ManualSync {
    fn init<'a>(&'a self) -> SyncFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish<'a>(&'a self, event: &'a SyncEvent) -> SyncFuture<'a, ()> {
        self.published.lock().push(event.clone());
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {
        self.subscribers.lock().clear();
    }
}
