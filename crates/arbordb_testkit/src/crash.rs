//! Plants the on-disk leftovers of an interrupted process.
//!
//! The helpers here write the transient names by hand, the same way a
//! store run would leave them behind after losing power mid-operation,
//! so recovery tests can start from a known-bad tree.

use std::path::{Path, PathBuf};

fn plant_dir(dir: &Path, files: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).expect("artifact dir");
    for (rel, contents) in files {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("artifact parents");
        }
        std::fs::write(path, contents).expect("artifact file");
    }
}

/// Creates an inflight rename directory, `~~<name>~<prev>`, holding
/// `files`. A crash before the chain's first rename leaves one of these.
pub fn plant_inflight_rename(
    root: &Path,
    name: &str,
    prev: &str,
    files: &[(&str, &str)],
) -> PathBuf {
    let dir = root.join(format!("~~{name}~{prev}"));
    plant_dir(&dir, files);
    dir
}

/// Creates a consistent rename directory, `~<name>~<prev>`, holding
/// `files`. A crash between the two renames leaves one of these.
pub fn plant_consistent_rename(
    root: &Path,
    name: &str,
    prev: &str,
    files: &[(&str, &str)],
) -> PathBuf {
    let dir = root.join(format!("~{name}~{prev}"));
    plant_dir(&dir, files);
    dir
}

/// Creates the inflight transaction staging directory, `~~.tran`.
pub fn plant_inflight_tran(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    let dir = root.join("~~.tran");
    plant_dir(&dir, files);
    dir
}

/// Creates the consistent transaction staging directory, `~.tran`. A
/// store that finds one at startup publishes it as the live tree.
pub fn plant_consistent_tran(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    let dir = root.join("~.tran");
    plant_dir(&dir, files);
    dir
}

/// Drops a transaction marker, `~tran~<pid>~<txid>`, as a peer process
/// would while its transaction is open.
pub fn plant_tran_marker(root: &Path, pid: u32, txid: &str) -> PathBuf {
    let path = root.join(format!("~tran~{pid}~{txid}"));
    std::fs::write(&path, b"").expect("marker file");
    path
}

/// A minimal split-set descriptor for planting documents by hand.
pub fn descriptor(entity_set: &str, id: &str, name: &str) -> String {
    format!(
        "{{\n    \"_id\": \"{id}\",\n    \"name\": \"{name}\",\n    \"$entitySet\": \"{entity_set}\"\n}}"
    )
}
