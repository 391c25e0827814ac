//! Store configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use arbordb_fs::LockOptions;

/// Configuration for opening a document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the document tree.
    pub data_directory: PathBuf,

    /// Advisory lock tuning (staleness, retries, retry pause).
    pub lock: LockOptions,

    /// How long the watcher coalesces native event bursts before emitting
    /// one reload.
    pub debounce: Duration,

    /// Root-relative subtrees the watcher ignores entirely (e.g. a blob
    /// storage directory maintained by someone else).
    pub ignored_paths: Vec<PathBuf>,

    /// Serialized documents at or above this size are published as a
    /// `refresh` instead of being sent in full.
    pub message_size_limit: usize,

    /// Bounded retries applied to every rename in the crash-safe chain.
    pub rename_retries: u32,

    /// Whether flat files are compacted in the background.
    pub compaction_enabled: bool,

    /// Pause between background compaction runs.
    pub compaction_interval: Duration,

    /// Fraction of unparsable flat-file lines above which the file is
    /// reported corrupt instead of partially loaded.
    pub corrupt_alert_threshold: f64,

    /// Longest a queued operation may wait before the sweeper fails it.
    pub queue_wait_timeout: Duration,

    /// How often the queue sweeper looks for timed-out items.
    pub queue_sweep_interval: Duration,
}

impl StoreConfig {
    /// Creates a configuration for `data_directory` with default values.
    #[must_use]
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            lock: LockOptions::default(),
            debounce: Duration::from_millis(800),
            ignored_paths: Vec::new(),
            message_size_limit: 60 * 1024,
            rename_retries: 10,
            compaction_enabled: true,
            compaction_interval: Duration::from_secs(15),
            corrupt_alert_threshold: 0.1,
            queue_wait_timeout: Duration::from_secs(60),
            queue_sweep_interval: Duration::from_secs(2),
        }
    }

    /// Returns the data directory.
    #[must_use]
    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Sets the advisory lock options.
    #[must_use]
    pub const fn lock(mut self, value: LockOptions) -> Self {
        self.lock = value;
        self
    }

    /// Sets the watcher debounce window.
    #[must_use]
    pub const fn debounce(mut self, value: Duration) -> Self {
        self.debounce = value;
        self
    }

    /// Adds a root-relative subtree the watcher should ignore.
    #[must_use]
    pub fn ignore_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.ignored_paths.push(value.into());
        self
    }

    /// Sets the published-document size threshold.
    #[must_use]
    pub const fn message_size_limit(mut self, value: usize) -> Self {
        self.message_size_limit = value;
        self
    }

    /// Sets how many times a contended rename is retried.
    #[must_use]
    pub const fn rename_retries(mut self, value: u32) -> Self {
        self.rename_retries = value;
        self
    }

    /// Enables or disables background compaction.
    #[must_use]
    pub const fn compaction_enabled(mut self, value: bool) -> Self {
        self.compaction_enabled = value;
        self
    }

    /// Sets the background compaction interval.
    #[must_use]
    pub const fn compaction_interval(mut self, value: Duration) -> Self {
        self.compaction_interval = value;
        self
    }

    /// Sets the corrupt flat-file alert threshold.
    #[must_use]
    pub const fn corrupt_alert_threshold(mut self, value: f64) -> Self {
        self.corrupt_alert_threshold = value;
        self
    }

    /// Sets the queue waiting timeout.
    #[must_use]
    pub const fn queue_wait_timeout(mut self, value: Duration) -> Self {
        self.queue_wait_timeout = value;
        self
    }

    /// Sets the queue sweeper interval.
    #[must_use]
    pub const fn queue_sweep_interval(mut self, value: Duration) -> Self {
        self.queue_sweep_interval = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::new("/tmp/store");
        assert_eq!(config.debounce, Duration::from_millis(800));
        assert_eq!(config.message_size_limit, 60 * 1024);
        assert!(config.compaction_enabled);
        assert_eq!(config.compaction_interval, Duration::from_secs(15));
        assert_eq!(config.queue_wait_timeout, Duration::from_secs(60));
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::new("/tmp/store")
            .debounce(Duration::from_millis(50))
            .message_size_limit(1024)
            .compaction_enabled(false)
            .ignore_path("storage");

        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.message_size_limit, 1024);
        assert!(!config.compaction_enabled);
        assert_eq!(config.ignored_paths, vec![PathBuf::from("storage")]);
    }
}
