//! Per-process record of recently written file state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// What the mirror believes this process last put at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEntry {
    /// A file with exactly this content.
    File(Vec<u8>),
    /// A directory created by this process.
    Directory,
}

/// Tracks what this process most recently wrote beneath the store root.
///
/// The watcher consults the mirror to decide whether a native filesystem
/// event was caused by this process (suppress) or by someone else (emit).
/// Keys are root-relative paths. Entries are cleared on removal and remapped
/// on rename, so the mirror always describes the tree as this process last
/// left it. It is not a cache of the tree itself: paths that were only ever
/// read are absent.
#[derive(Debug, Default)]
pub struct WriteMirror {
    entries: RwLock<HashMap<PathBuf, MirrorEntry>>,
}

impl WriteMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a full-file write.
    pub fn record_file(&self, path: &Path, content: &[u8]) {
        self.entries
            .write()
            .insert(path.to_path_buf(), MirrorEntry::File(content.to_vec()));
    }

    /// Records an append.
    ///
    /// `previous` carries the on-disk content from before the append for
    /// files this process never wrote; without it the mirror would hold a
    /// suffix and misreport every later comparison as an external change.
    pub fn record_append(&self, path: &Path, previous: Option<&[u8]>, content: &[u8]) {
        let mut entries = self.entries.write();
        match entries.get_mut(path) {
            Some(MirrorEntry::File(existing)) => existing.extend_from_slice(content),
            _ => {
                let mut full = previous.map(<[u8]>::to_vec).unwrap_or_default();
                full.extend_from_slice(content);
                entries.insert(path.to_path_buf(), MirrorEntry::File(full));
            }
        }
    }

    /// Records a directory creation, including any parents created with it.
    pub fn record_directory(&self, path: &Path) {
        let mut entries = self.entries.write();
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            entries
                .entry(current.clone())
                .or_insert(MirrorEntry::Directory);
        }
    }

    /// Drops every entry at or beneath `path`.
    pub fn forget(&self, path: &Path) {
        self.entries.write().retain(|p, _| !p.starts_with(path));
    }

    /// Remaps every entry at or beneath `from` to the same position under `to`.
    pub fn remap(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.write();
        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = entries.remove(&key) {
                match key.strip_prefix(from) {
                    Ok(suffix) if suffix.as_os_str().is_empty() => {
                        entries.insert(to.to_path_buf(), entry);
                    }
                    Ok(suffix) => {
                        entries.insert(to.join(suffix), entry);
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// True when the mirror holds exactly `content` for `path`.
    pub fn matches_file(&self, path: &Path, content: &[u8]) -> bool {
        matches!(
            self.entries.read().get(path),
            Some(MirrorEntry::File(c)) if c.as_slice() == content
        )
    }

    /// True when the mirror knows `path` as a directory.
    pub fn knows_directory(&self, path: &Path) -> bool {
        matches!(self.entries.read().get(path), Some(MirrorEntry::Directory))
    }

    /// True when the mirror has any entry for `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.read().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_file_then_match() {
        let mirror = WriteMirror::new();
        mirror.record_file(Path::new("a/config.json"), b"{}");

        assert!(mirror.matches_file(Path::new("a/config.json"), b"{}"));
        assert!(!mirror.matches_file(Path::new("a/config.json"), b"{ }"));
        assert!(!mirror.matches_file(Path::new("b/config.json"), b"{}"));
    }

    #[test]
    fn append_extends_existing_record() {
        let mirror = WriteMirror::new();
        mirror.record_file(Path::new("settings"), b"one\n");
        mirror.record_append(Path::new("settings"), None, b"two\n");

        assert!(mirror.matches_file(Path::new("settings"), b"one\ntwo\n"));
    }

    #[test]
    fn append_seeds_from_previous_disk_content() {
        let mirror = WriteMirror::new();
        mirror.record_append(Path::new("settings"), Some(b"old\n"), b"new\n");

        assert!(mirror.matches_file(Path::new("settings"), b"old\nnew\n"));
    }

    #[test]
    fn record_directory_includes_parents() {
        let mirror = WriteMirror::new();
        mirror.record_directory(Path::new("a/b/c"));

        assert!(mirror.knows_directory(Path::new("a")));
        assert!(mirror.knows_directory(Path::new("a/b")));
        assert!(mirror.knows_directory(Path::new("a/b/c")));
    }

    #[test]
    fn forget_clears_subtree() {
        let mirror = WriteMirror::new();
        mirror.record_directory(Path::new("a/b"));
        mirror.record_file(Path::new("a/b/config.json"), b"{}");
        mirror.record_file(Path::new("a.json"), b"{}");

        mirror.forget(Path::new("a"));

        assert!(!mirror.contains(Path::new("a")));
        assert!(!mirror.contains(Path::new("a/b")));
        assert!(!mirror.contains(Path::new("a/b/config.json")));
        assert!(mirror.contains(Path::new("a.json")));
    }

    #[test]
    fn remap_moves_subtree() {
        let mirror = WriteMirror::new();
        mirror.record_directory(Path::new("~~foo~foo"));
        mirror.record_file(Path::new("~~foo~foo/config.json"), b"{}");

        mirror.remap(Path::new("~~foo~foo"), Path::new("~foo~foo"));

        assert!(!mirror.contains(Path::new("~~foo~foo")));
        assert!(mirror.knows_directory(Path::new("~foo~foo")));
        assert!(mirror.matches_file(Path::new("~foo~foo/config.json"), b"{}"));
    }

    proptest::proptest! {
        #[test]
        fn remap_preserves_file_content(
            segments in proptest::collection::vec("[a-z]{1,8}", 1..4),
            content in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64),
        ) {
            let mirror = WriteMirror::new();
            let source: PathBuf = segments.iter().collect();
            mirror.record_file(&source, &content);

            mirror.remap(&source, Path::new("__dest__"));

            proptest::prop_assert!(!mirror.contains(&source));
            proptest::prop_assert!(mirror.matches_file(Path::new("__dest__"), &content));
        }
    }
}
