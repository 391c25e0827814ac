//! Error types for ArborDB core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in ArborDB store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem adapter error (I/O, path safety, lock timeout).
    #[error("filesystem error: {0}")]
    Fs(#[from] arbordb_fs::FsError),

    /// A public-key value contains a path separator.
    #[error("invalid key {key:?} for entity set {entity_set}: path separators are not allowed")]
    InvalidKey {
        /// The entity set being written.
        entity_set: String,
        /// The offending key value.
        key: String,
    },

    /// An insert collides with an existing document path.
    #[error("duplicate key {key:?} in entity set {entity_set}")]
    DuplicateKey {
        /// The entity set being written.
        entity_set: String,
        /// The colliding key value.
        key: String,
    },

    /// A queued operation waited too long before starting.
    #[error("operation timed out in queue after {waited_ms}ms")]
    QueueTimeout {
        /// How long the item sat in the queue, in milliseconds.
        waited_ms: u64,
    },

    /// The queue was closed before the operation could run.
    #[error("operation queue is closed")]
    QueueClosed,

    /// A transaction's activation step could not acquire the store lock.
    #[error("transaction start timed out")]
    TransactionStartTimeout {
        /// The lock failure behind the timeout.
        #[source]
        source: arbordb_fs::FsError,
    },

    /// A concurrent commit changed an entity this transaction had read.
    #[error("transaction conflict on document {id} in entity set {entity_set}")]
    TransactionConflict {
        /// The entity set where the conflict occurred.
        entity_set: String,
        /// The document id that conflicted.
        id: String,
    },

    /// The transaction handle has already been committed or rolled back.
    #[error("transaction is already {state}")]
    TransactionClosed {
        /// Terminal state the transaction reached.
        state: &'static str,
    },

    /// A descriptor file failed to parse as JSON.
    #[error("corrupt descriptor at {path}")]
    CorruptDescriptor {
        /// Root-relative path of the descriptor file.
        path: PathBuf,
        /// The underlying parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// Too many lines of a flat entity-set file failed to parse.
    #[error("corrupt flat file for entity set {entity_set}: {corrupt} of {total} lines unparsable")]
    CorruptFlatFile {
        /// The flat entity set.
        entity_set: String,
        /// Number of unparsable lines.
        corrupt: usize,
        /// Total number of non-empty lines.
        total: usize,
    },

    /// The model has no entity set with this name.
    #[error("unknown entity set: {name}")]
    UnknownEntitySet {
        /// Name of the missing entity set.
        name: String,
    },

    /// A document model could not be built.
    #[error("invalid model: {message}")]
    InvalidModel {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The filesystem watcher could not be started or armed.
    #[error("file watcher error: {message}")]
    Watch {
        /// Description from the watcher backend.
        message: String,
    },

    /// The store is closed.
    #[error("store is closed")]
    StoreClosed,
}

impl StoreError {
    /// Creates an [`StoreError::InvalidKey`].
    pub fn invalid_key(entity_set: impl Into<String>, key: impl Into<String>) -> Self {
        Self::InvalidKey {
            entity_set: entity_set.into(),
            key: key.into(),
        }
    }

    /// Creates a [`StoreError::DuplicateKey`].
    pub fn duplicate_key(entity_set: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            entity_set: entity_set.into(),
            key: key.into(),
        }
    }

    /// Creates a [`StoreError::TransactionConflict`].
    pub fn transaction_conflict(entity_set: impl Into<String>, id: impl Into<String>) -> Self {
        Self::TransactionConflict {
            entity_set: entity_set.into(),
            id: id.into(),
        }
    }

    /// Creates a [`StoreError::CorruptDescriptor`].
    pub fn corrupt_descriptor(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::CorruptDescriptor {
            path: path.into(),
            source,
        }
    }

    /// Creates an [`StoreError::UnknownEntitySet`].
    pub fn unknown_entity_set(name: impl Into<String>) -> Self {
        Self::UnknownEntitySet { name: name.into() }
    }

    /// Creates an [`StoreError::InvalidModel`].
    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::InvalidModel {
            message: message.into(),
        }
    }

    /// Creates an [`StoreError::InvalidOperation`].
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a [`StoreError::Watch`].
    pub fn watch(message: impl Into<String>) -> Self {
        Self::Watch {
            message: message.into(),
        }
    }
}
