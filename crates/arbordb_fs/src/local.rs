//! Local-disk backend rooted at a data directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::backend::{FsBackend, FsFuture, FsStat};
use crate::error::{FsError, FsResult};
use crate::lock::{LockFile, LockOptions};
use crate::mirror::WriteMirror;

/// Name of the advisory lock file kept directly under the root.
pub const LOCK_FILE_NAME: &str = "fs.lock";

/// [`FsBackend`] over a local directory tree.
///
/// All paths are resolved against the root; absolute paths and `..`
/// components are rejected so no document can escape the tree. Every
/// mutation is recorded in a [`WriteMirror`] before it reaches the disk.
#[derive(Debug)]
pub struct DirectoryFs {
    root: PathBuf,
    mirror: WriteMirror,
    lock: LockFile,
}

impl DirectoryFs {
    /// Creates a backend rooted at `root` with default lock options.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_lock_options(root, LockOptions::default())
    }

    /// Creates a backend rooted at `root` with explicit lock options.
    pub fn with_lock_options(root: impl Into<PathBuf>, options: LockOptions) -> Self {
        let root = root.into();
        let lock = LockFile::new(root.join(LOCK_FILE_NAME), options);
        Self {
            root,
            mirror: WriteMirror::new(),
            lock,
        }
    }

    fn resolve(&self, path: &Path) -> FsResult<PathBuf> {
        if path.is_absolute() {
            return Err(FsError::invalid_path(path));
        }
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(FsError::invalid_path(path)),
            }
        }
        Ok(resolved)
    }
}

impl FsBackend for DirectoryFs {
    fn init(&self) -> FsFuture<'_, ()> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root).await?;
            Ok(())
        })
    }

    fn read_file<'a>(&'a self, path: &'a Path) -> FsFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            Ok(tokio::fs::read(full).await?)
        })
    }

    fn write_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            self.mirror.record_file(path, content);
            tokio::fs::write(full, content).await?;
            Ok(())
        })
    }

    fn append_file<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            // Seed the mirror with the pre-append disk content the first
            // time we touch a file this process never wrote.
            let previous = if self.mirror.contains(path) {
                None
            } else {
                tokio::fs::read(&full).await.ok()
            };
            self.mirror.record_append(path, previous.as_deref(), content);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(full)
                .await?;
            file.write_all(content).await?;
            Ok(())
        })
    }

    fn rename<'a>(&'a self, from: &'a Path, to: &'a Path) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let source = self.resolve(from)?;
            let target = self.resolve(to)?;
            self.mirror.remap(from, to);
            tokio::fs::rename(source, target).await?;
            Ok(())
        })
    }

    fn mkdir<'a>(&'a self, path: &'a Path) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            self.mirror.record_directory(path);
            tokio::fs::create_dir_all(full).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> FsFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            self.mirror.forget(path);
            let meta = match tokio::fs::metadata(&full).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let removal = if meta.is_dir() {
                tokio::fs::remove_dir_all(&full).await
            } else {
                tokio::fs::remove_file(&full).await
            };
            match removal {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> FsFuture<'a, bool> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            Ok(tokio::fs::try_exists(full).await?)
        })
    }

    fn stat<'a>(&'a self, path: &'a Path) -> FsFuture<'a, FsStat> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let meta = tokio::fs::metadata(full).await?;
            Ok(FsStat {
                is_directory: meta.is_dir(),
                modified: meta.modified().ok(),
                size: meta.len(),
            })
        })
    }

    fn list<'a>(&'a self, path: &'a Path) -> FsFuture<'a, Vec<String>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let mut reader = tokio::fs::read_dir(full).await?;
            let mut names = Vec::new();
            while let Some(entry) = reader.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names)
        })
    }

    fn lock(&self) -> FsFuture<'_, ()> {
        Box::pin(async move { self.lock.acquire().await })
    }

    fn unlock(&self) -> FsFuture<'_, ()> {
        Box::pin(async move { self.lock.release().await })
    }

    fn root_path(&self) -> &Path {
        &self.root
    }

    fn self_wrote_file(&self, path: &Path, content: &[u8]) -> bool {
        self.mirror.matches_file(path, content)
    }

    fn self_wrote_directory(&self, path: &Path) -> bool {
        self.mirror.knows_directory(path)
    }

    fn self_wrote(&self, path: &Path) -> bool {
        self.mirror.contains(path)
    }
}
