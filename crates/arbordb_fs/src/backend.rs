//! Filesystem backend trait definition.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::SystemTime;

use crate::error::FsResult;

/// Boxed future returned by [`FsBackend`] methods.
///
/// The trait must stay object safe so stores can hold `Arc<dyn FsBackend>`,
/// which rules out native `async fn`; implementations box their futures.
pub type FsFuture<'a, T> = Pin<Box<dyn Future<Output = FsResult<T>> + Send + 'a>>;

/// Metadata for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// Last modification time, where the platform reports one.
    pub modified: Option<SystemTime>,
    /// Size in bytes (directories report a platform-defined value).
    pub size: u64,
}

/// A filesystem a document store can live on.
///
/// All paths are relative to a root chosen at construction time. Backends
/// are dumb byte trees: the store owns layout, naming, and crash-recovery
/// conventions; backends only move bytes and directory entries around.
///
/// # Invariants
///
/// - `remove` is recursive and succeeds on a missing path
/// - `mkdir` creates missing parents and succeeds if the directory exists
/// - `rename` follows platform semantics; the store never renames onto an
///   existing non-empty directory
/// - every mutation is reflected in the backend's self-write record before
///   the filesystem call completes, so a watcher consulting `self_wrote_*`
///   never races ahead of it
///
/// # Implementors
///
/// - [`super::DirectoryFs`] - local disk, the default
pub trait FsBackend: Send + Sync + std::fmt::Debug {
    /// Prepares the root so the remaining operations can run.
    fn init(&self) -> FsFuture<'_, ()>;

    /// Reads the full content of a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unreadable.
    fn read_file<'a>(&'a self, path: &'a Path) -> FsFuture<'a, Vec<u8>>;

    /// Writes (creating or truncating) the full content of a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory is missing or on I/O failure.
    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> FsFuture<'a, ()>;

    /// Appends bytes to a file, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> FsFuture<'a, ()>;

    /// Renames a file or directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is missing or the platform refuses
    /// the rename (e.g. target is a non-empty directory).
    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> FsFuture<'a, ()>;

    /// Creates a directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn mkdir<'a>(&'a self, path: &'a Path) -> FsFuture<'a, ()>;

    /// Removes a file or directory tree. Missing paths are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than absence.
    fn remove<'a>(&'a self, path: &'a Path) -> FsFuture<'a, ()>;

    /// Whether anything exists at the path.
    ///
    /// # Errors
    ///
    /// Returns an error if existence cannot be determined.
    fn exists<'a>(&'a self, path: &'a Path) -> FsFuture<'a, bool>;

    /// Metadata for the path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or unreadable.
    fn stat<'a>(&'a self, path: &'a Path) -> FsFuture<'a, FsStat>;

    /// Names of the entries directly inside a directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing or unreadable.
    fn list<'a>(&'a self, path: &'a Path) -> FsFuture<'a, Vec<String>>;

    /// Acquires the cross-process advisory lock.
    ///
    /// Not reentrant: a caller must never acquire while already holding it
    /// for the same logical operation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::FsError::LockTimeout`] once retries are exhausted.
    fn lock(&self) -> FsFuture<'_, ()>;

    /// Releases the advisory lock. Succeeds if the lock is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn unlock(&self) -> FsFuture<'_, ()>;

    /// Absolute path of the root this backend is scoped to.
    fn root_path(&self) -> &Path;

    /// True when `path` holds exactly `content` because this process wrote it.
    fn self_wrote_file(&self, path: &Path, content: &[u8]) -> bool;

    /// True when `path` is a directory this process created.
    fn self_wrote_directory(&self, path: &Path) -> bool;

    /// True when this process has any record of writing `path`.
    fn self_wrote(&self, path: &Path) -> bool;
}
