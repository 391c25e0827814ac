//! # ArborDB Core
//!
//! Embedded document store over a plain directory tree.
//!
//! This crate provides:
//! - Human-editable persistence: every document is a directory with a
//!   `config.json` descriptor, selected properties extracted into
//!   sibling files with friendly extensions
//! - An in-memory cache serving all reads, patched in place by writes
//! - A FIFO operation queue so mutations never interleave
//! - Crash-safe writes via a temp-directory rename choreography
//! - Cross-process coordination: an advisory lock file, a filesystem
//!   watcher, and document-level reconciliation of external edits
//! - Transactions with an isolated staged view, commit-time conflict
//!   detection, and recovery of interrupted commits at startup
//!
//! ## Key Invariants
//!
//! - The cache only ever shows committed states
//! - Writes become visible through whole-directory renames, never
//!   through partially written files
//! - Names starting with `~` are transient and ignored by readers
//! - An external change wins only when its stamp is strictly newer
//!
//! ## Example
//!
//! ```rust
//! use arbordb_core::{DocumentModel, DocumentStore, Query, StoreConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> arbordb_core::StoreResult<()> {
//! let model = DocumentModel::builder()
//!     .split_set("templates", "name", |set| set.text_property("content", "html"))
//!     .flat_set("settings")
//!     .build()?;
//! let store = DocumentStore::open(StoreConfig::new("./data"), model).await?;
//!
//! store
//!     .insert("templates", json!({"name": "invoice", "content": "<h1>Hi</h1>"}))
//!     .await?;
//! let hits = store.find("templates", Query::field("name", "invoice")).to_vec()?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod document;
mod error;
mod layout;
mod model;
mod persistence;
mod query;
mod queue;
mod retry;
mod store;
mod sync;
mod transaction;

pub use codec::{decode_binary, decode_date, encode_binary, encode_date};
pub use config::StoreConfig;
pub use document::{Document, DocumentSet, JsonMap};
pub use error::{StoreError, StoreResult};
pub use model::{
    DocumentModel, DocumentModelBuilder, DocumentProperty, EntitySet, EntitySetBuilder,
    PropertyKind, FOLDERS_SET,
};
pub use persistence::ExtensionResolver;
pub use query::{DefaultMatcher, Query, QueryMatcher, SortOrder, UpdateSpec};
pub use queue::OperationQueue;
pub use store::{
    DocumentStore, ExternalModification, ExternalModificationKind, FindQuery, StoreBuilder,
    UpdateOptions,
};
pub use sync::{ChangeSync, DocRef, FsWatchSync, SyncEvent, SyncFuture};
pub use transaction::Transaction;

pub use arbordb_fs::{
    DirectoryFs, FsBackend, FsError, FsFuture, FsResult, FsStat, LockOptions, LOCK_FILE_NAME,
};
