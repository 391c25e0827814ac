//! Error types for filesystem adapter operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for filesystem adapter operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors that can occur in the filesystem adapter.
#[derive(Debug, Error)]
pub enum FsError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A caller-supplied path would resolve outside the store root.
    #[error("path escapes the store root: {path}")]
    InvalidPath {
        /// The offending path, as given by the caller.
        path: PathBuf,
    },

    /// The advisory lock could not be acquired before retries ran out.
    #[error("advisory lock not acquired after {attempts} attempts over {waited_ms}ms")]
    LockTimeout {
        /// Number of acquisition attempts made.
        attempts: u32,
        /// Total time spent trying, in milliseconds.
        waited_ms: u64,
    },
}

impl FsError {
    /// Creates an [`FsError::InvalidPath`].
    pub fn invalid_path(path: impl Into<PathBuf>) -> Self {
        Self::InvalidPath { path: path.into() }
    }
}
