//! # ArborDB filesystem layer
//!
//! The pieces of ArborDB that actually touch the disk:
//!
//! - [`FsBackend`] - the object-safe trait the store drives; all paths are
//!   relative to a configured root
//! - [`DirectoryFs`] - the local-disk implementation
//! - [`WriteMirror`] - a per-process record of recent writes, consulted by
//!   the change watcher to tell self-writes from external edits
//! - [`LockFile`] - the `fs.lock` advisory lock with stale takeover and
//!   bounded retries
//!
//! Everything above this crate (document layout, crash-recovery naming,
//! caching, transactions) lives in `arbordb_core`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod local;
mod lock;
mod mirror;

pub use backend::{FsBackend, FsFuture, FsStat};
pub use error::{FsError, FsResult};
pub use local::{DirectoryFs, LOCK_FILE_NAME};
pub use lock::{LockFile, LockOptions};
pub use mirror::{MirrorEntry, WriteMirror};
