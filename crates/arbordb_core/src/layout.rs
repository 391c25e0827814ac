//! On-disk naming conventions.
//!
//! Every transient name in the tree starts with `~`: in-flight document
//! writes (`~~<name>~<previous>`), complete-but-unrenamed writes
//! (`~<name>~<previous>`), flat-file compaction temps (`~<set>`), the
//! transaction staging directories, and cross-process transaction marker
//! files. Loading resolves or discards the first three; staging and
//! markers are reserved and never treated as documents.

/// Descriptor file name inside every split document directory.
pub(crate) const DESCRIPTOR_FILE: &str = "config.json";

/// In-flight staging directory of a committing transaction.
pub(crate) const TRAN_STAGING_INFLIGHT: &str = "~~.tran";

/// Consistent staging directory: replay finished, publish pending.
pub(crate) const TRAN_STAGING_CONSISTENT: &str = "~.tran";

/// Prefix of cross-process transaction marker files.
pub(crate) const TRAN_MARKER_PREFIX: &str = "~tran~";

pub(crate) fn inflight_name(final_name: &str, previous_name: &str) -> String {
    format!("~~{final_name}~{previous_name}")
}

pub(crate) fn consistent_name(final_name: &str, previous_name: &str) -> String {
    format!("~{final_name}~{previous_name}")
}

pub(crate) fn flat_temp_name(entity_set: &str) -> String {
    format!("~{entity_set}")
}

pub(crate) fn marker_name(pid: u32, transaction_id: &str) -> String {
    format!("{TRAN_MARKER_PREFIX}{pid}~{transaction_id}")
}

/// Parses `~tran~<pid>~<txid>` into the owning pid and transaction id.
pub(crate) fn parse_marker(name: &str) -> Option<(u32, &str)> {
    let rest = name.strip_prefix(TRAN_MARKER_PREFIX)?;
    let (pid, transaction_id) = rest.split_once('~')?;
    if transaction_id.is_empty() {
        return None;
    }
    Some((pid.parse().ok()?, transaction_id))
}

/// Names the loader must never treat as documents or crash artifacts.
pub(crate) fn is_reserved(name: &str) -> bool {
    name == arbordb_fs::LOCK_FILE_NAME
        || name == TRAN_STAGING_INFLIGHT
        || name == TRAN_STAGING_CONSISTENT
        || name.starts_with(TRAN_MARKER_PREFIX)
}

/// A leftover transient name found while loading.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CrashArtifact<'a> {
    /// `~~<name>~<previous>`: the write never reached the consistent point.
    Abandoned,
    /// `~<name>~<previous>`: the write is complete, only the final rename
    /// is missing. Keys containing `~` are not representable here; the
    /// first `~` after the prefix delimits the final name.
    Consistent {
        /// Name the directory should end up under.
        final_name: &'a str,
        /// Location the document previously lived at.
        previous_name: &'a str,
    },
    /// `~<set>`: a flat compaction temp that never got renamed.
    FlatTemp,
}

/// Classifies a directory entry; `None` for reserved and non-transient names.
pub(crate) fn classify_artifact(name: &str) -> Option<CrashArtifact<'_>> {
    if is_reserved(name) || !name.starts_with('~') {
        return None;
    }
    if name.starts_with("~~") {
        return Some(CrashArtifact::Abandoned);
    }
    match name[1..].split_once('~') {
        Some((final_name, previous_name)) => Some(CrashArtifact::Consistent {
            final_name,
            previous_name,
        }),
        None => Some(CrashArtifact::FlatTemp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_chain_names() {
        assert_eq!(inflight_name("foo", "foo"), "~~foo~foo");
        assert_eq!(consistent_name("renamed", "foo"), "~renamed~foo");
        assert_eq!(flat_temp_name("settings"), "~settings");
    }

    #[test]
    fn marker_roundtrip() {
        let name = marker_name(4242, "abc123");
        assert_eq!(name, "~tran~4242~abc123");
        assert_eq!(parse_marker(&name), Some((4242, "abc123")));

        assert_eq!(parse_marker("~tran~notapid~x"), None);
        assert_eq!(parse_marker("~tran~99~"), None);
        assert_eq!(parse_marker("~other"), None);
    }

    #[test]
    fn classification() {
        assert_eq!(classify_artifact("~~a~b"), Some(CrashArtifact::Abandoned));
        assert_eq!(
            classify_artifact("~c~c"),
            Some(CrashArtifact::Consistent {
                final_name: "c",
                previous_name: "c"
            })
        );
        assert_eq!(
            classify_artifact("~renamed~old"),
            Some(CrashArtifact::Consistent {
                final_name: "renamed",
                previous_name: "old"
            })
        );
        assert_eq!(classify_artifact("~settings"), Some(CrashArtifact::FlatTemp));
        assert_eq!(classify_artifact("plain"), None);
    }

    #[test]
    fn reserved_names_are_never_artifacts() {
        assert!(is_reserved("fs.lock"));
        assert!(is_reserved("~.tran"));
        assert!(is_reserved("~~.tran"));
        assert!(is_reserved("~tran~1~x"));
        assert_eq!(classify_artifact("~.tran"), None);
        assert_eq!(classify_artifact("~~.tran"), None);
        assert_eq!(classify_artifact("~tran~1~x"), None);
    }
}
