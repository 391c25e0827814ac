//! Advisory lock file with stale takeover and bounded retries.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{FsError, FsResult};

/// Tuning for [`LockFile`] acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Age after which a lock file left behind by a dead process is taken over.
    pub stale_after: Duration,
    /// Acquisition retries before giving up.
    pub retries: u32,
    /// Pause between retries.
    pub retry_wait: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5),
            retries: 100,
            retry_wait: Duration::from_millis(100),
        }
    }
}

/// A cross-process advisory lock backed by a single lock file.
///
/// Acquisition creates the file exclusively and writes the holder's pid; a
/// holder that crashes leaves the file behind, so a file older than
/// `stale_after` is deleted and the attempt repeated. The lock is advisory
/// and not reentrant.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    options: LockOptions,
}

impl LockFile {
    /// Creates a lock handle for `path` (conventionally `<root>/fs.lock`).
    pub fn new(path: PathBuf, options: LockOptions) -> Self {
        Self { path, options }
    }

    /// Acquires the lock, retrying per the configured options.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::LockTimeout`] once retries are exhausted, or any
    /// I/O error other than the file already existing.
    pub async fn acquire(&self) -> FsResult<()> {
        let started = Instant::now();
        let mut attempts = 0u32;
        while attempts <= self.options.retries {
            attempts += 1;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if self.is_stale().await {
                        warn!(
                            target: "arbordb::fs",
                            path = %self.path.display(),
                            "breaking stale lock file"
                        );
                        let _ = tokio::fs::remove_file(&self.path).await;
                        continue;
                    }
                    if attempts <= self.options.retries {
                        tokio::time::sleep(self.options.retry_wait).await;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(FsError::LockTimeout {
            attempts,
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Releases the lock. Succeeds even when the file is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than absence.
    pub async fn release(&self) -> FsResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_stale(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => match meta.modified() {
                Ok(modified) => SystemTime::now()
                    .duration_since(modified)
                    .map(|age| age >= self.options.stale_after)
                    .unwrap_or(false),
                Err(_) => false,
            },
            // The holder released between our open attempt and this stat.
            Err(_) => true,
        }
    }
}
