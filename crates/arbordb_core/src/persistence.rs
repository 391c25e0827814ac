//! Translates document mutations into the on-disk tree and back.
//!
//! Split sets follow the crash-safe rename chain: write the document under
//! `~~<name>~<previous>`, rename it to `~<name>~<previous>` once every
//! byte is in place, drop the previous location, then rename onto the
//! final name. Loading resolves whatever the chain left behind after a
//! crash: doubly prefixed directories are abandoned, singly prefixed ones
//! are completed. Flat sets are append-only JSON-lines logs with
//! `$$deleted` tombstones, rewritten by compaction through the same
//! temp-then-rename pattern.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use arbordb_fs::FsBackend;

use crate::codec;
use crate::document::{
    deep_set, uid, Document, DocumentSet, JsonMap, DELETED_FIELD, ENTITY_SET_FIELD, FOLDER_FIELD,
    ID_FIELD, SHORTID_FIELD,
};
use crate::error::{StoreError, StoreResult};
use crate::layout::{self, CrashArtifact};
use crate::model::{DocumentModel, DocumentProperty, EntitySet, PropertyKind, FOLDERS_SET};
use crate::retry::retry;

/// Resolves the file extension of one document property; the first
/// resolver returning `Some` wins, the property's declared extension is
/// the fallback.
pub type ExtensionResolver =
    Box<dyn Fn(&Document, &str, &DocumentProperty) -> Option<String> + Send + Sync>;

/// Registered resolver chain, shared between the store facade and the
/// persistence engine.
#[derive(Default)]
pub(crate) struct ResolverChain {
    resolvers: parking_lot::RwLock<Vec<ExtensionResolver>>,
}

impl ResolverChain {
    pub(crate) fn register(&self, resolver: ExtensionResolver) {
        self.resolvers.write().push(resolver);
    }

    fn resolve(&self, doc: &Document, entity_set: &str, property: &DocumentProperty) -> String {
        for resolver in self.resolvers.read().iter() {
            if let Some(extension) = resolver(doc, entity_set, property) {
                return extension;
            }
        }
        property.extension().to_string()
    }
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverChain")
            .field("registered", &self.resolvers.read().len())
            .finish_non_exhaustive()
    }
}

/// Acquires the cross-process lock around `op`, releasing it on both
/// paths. The operation error wins over a release error.
pub(crate) async fn with_lock<T, Fut>(
    fs: &dyn FsBackend,
    op: impl FnOnce() -> Fut,
) -> StoreResult<T>
where
    Fut: Future<Output = StoreResult<T>>,
{
    fs.lock().await?;
    let result = op().await;
    let unlock = fs.unlock().await;
    match (result, unlock) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err.into()),
    }
}

fn validate_key(entity_set: &str, key: &str) -> StoreResult<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') {
        return Err(StoreError::invalid_key(entity_set, key));
    }
    Ok(())
}

/// The persistence engine.
///
/// `prefix` roots every path it touches: the live tree uses an empty
/// prefix, and a committing transaction re-roots a second engine at its
/// staging directory via [`Persistence::scoped`].
#[derive(Debug, Clone)]
pub(crate) struct Persistence {
    fs: Arc<dyn FsBackend>,
    model: Arc<DocumentModel>,
    resolvers: Arc<ResolverChain>,
    prefix: PathBuf,
    rename_retries: u32,
    corrupt_alert_threshold: f64,
}

impl Persistence {
    pub(crate) fn new(
        fs: Arc<dyn FsBackend>,
        model: Arc<DocumentModel>,
        resolvers: Arc<ResolverChain>,
        rename_retries: u32,
        corrupt_alert_threshold: f64,
    ) -> Self {
        Self {
            fs,
            model,
            resolvers,
            prefix: PathBuf::new(),
            rename_retries,
            corrupt_alert_threshold,
        }
    }

    /// The same engine rooted at a subdirectory of the tree.
    pub(crate) fn scoped(&self, prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self.clone()
        }
    }

    fn at(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.prefix.join(rel)
    }

    // ---- path derivation ----------------------------------------------

    /// Walks folder short ids up to the root and returns the directory the
    /// ancestry spells out.
    fn folder_dir(&self, shortid: Option<&str>, all: &DocumentSet) -> StoreResult<PathBuf> {
        let mut segments = Vec::new();
        let mut current = shortid.map(str::to_string);
        while let Some(sid) = current {
            if segments.len() > 64 {
                return Err(StoreError::invalid_operation(
                    "folder hierarchy too deep or cyclic",
                ));
            }
            let folder = all.folder_by_shortid(&sid).ok_or_else(|| {
                StoreError::invalid_operation(format!("unknown folder shortid: {sid}"))
            })?;
            let name = folder
                .str_field(crate::model::FOLDERS_KEY)
                .ok_or_else(|| StoreError::invalid_operation("folder without a name"))?;
            segments.push(name.to_string());
            current = folder.folder_shortid().map(str::to_string);
        }
        segments.reverse();
        Ok(segments.iter().collect())
    }

    fn public_key_value<'a>(&self, doc: &'a Document, set: &EntitySet) -> StoreResult<&'a str> {
        let field = set.public_key().ok_or_else(|| {
            StoreError::invalid_operation(format!("{} is not a split set", set.name()))
        })?;
        doc.str_field(field).ok_or_else(|| {
            StoreError::invalid_operation(format!(
                "document in {} has no string value for its public key {field}",
                set.name()
            ))
        })
    }

    /// Root-relative directory of a split document.
    fn document_dir(
        &self,
        doc: &Document,
        set: &EntitySet,
        all: &DocumentSet,
    ) -> StoreResult<PathBuf> {
        let key = self.public_key_value(doc, set)?;
        Ok(self.folder_dir(doc.folder_shortid(), all)?.join(key))
    }

    // ---- serialization -------------------------------------------------

    /// Descriptor content: the body minus document properties and the
    /// derived folder reference, plus the owning entity set.
    fn descriptor_value(&self, doc: &Document, set: &EntitySet) -> Value {
        let mut body = doc.body().clone();
        for property in set.document_properties() {
            crate::document::deep_delete(&mut body, property.path());
        }
        body.remove(FOLDER_FIELD);
        body.insert(
            ENTITY_SET_FIELD.to_string(),
            Value::String(set.name().to_string()),
        );
        Value::Object(body)
    }

    fn flat_record(&self, doc: &Document) -> Value {
        let mut body = doc.body().clone();
        body.insert(
            ENTITY_SET_FIELD.to_string(),
            Value::String(doc.entity_set().to_string()),
        );
        Value::Object(body)
    }

    // ---- mutations -----------------------------------------------------

    pub(crate) async fn insert(&self, doc: &Document, all: &DocumentSet) -> StoreResult<()> {
        let set = self.model.require(doc.entity_set())?;
        if set.is_split() {
            self.write_split(doc, None, set, all).await
        } else {
            self.append_flat(doc).await
        }
    }

    pub(crate) async fn update(
        &self,
        doc: &Document,
        original: &Document,
        all: &DocumentSet,
    ) -> StoreResult<()> {
        let set = self.model.require(doc.entity_set())?;
        if set.is_split() {
            self.write_split(doc, Some(original), set, all).await
        } else {
            self.append_flat(doc).await
        }
    }

    pub(crate) async fn remove(&self, doc: &Document, all: &DocumentSet) -> StoreResult<()> {
        let set = self.model.require(doc.entity_set())?;
        if set.is_split() {
            let dir = self.document_dir(doc, set, all)?;
            self.fs.remove(&self.at(dir)).await?;
        } else {
            let mut tombstone = JsonMap::new();
            if let Some(id) = doc.id() {
                tombstone.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            }
            tombstone.insert(DELETED_FIELD.to_string(), Value::Bool(true));
            let line = format!("{}\n", codec::to_line_json(&Value::Object(tombstone))?);
            self.fs
                .append_file(&self.at(doc.entity_set()), line.as_bytes())
                .await?;
        }
        Ok(())
    }

    async fn append_flat(&self, doc: &Document) -> StoreResult<()> {
        let line = format!("{}\n", codec::to_line_json(&self.flat_record(doc))?);
        self.fs
            .append_file(&self.at(doc.entity_set()), line.as_bytes())
            .await?;
        Ok(())
    }

    async fn write_split(
        &self,
        doc: &Document,
        original: Option<&Document>,
        set: &EntitySet,
        all: &DocumentSet,
    ) -> StoreResult<()> {
        let key = self.public_key_value(doc, set)?.to_string();
        validate_key(set.name(), &key)?;

        let target_dir = self.document_dir(doc, set, all)?;
        let previous_dir = match original {
            Some(original) => Some(self.document_dir(original, set, all)?),
            None => None,
        };
        let moving = previous_dir.as_deref() != Some(target_dir.as_path());

        if self.fs.exists(&self.at(&target_dir)).await? && (original.is_none() || moving) {
            return Err(StoreError::duplicate_key(set.name(), &key));
        }

        let previous_key = match original {
            Some(original) => self.public_key_value(original, set)?.to_string(),
            None => key.clone(),
        };
        let parent_dir = target_dir.parent().map(Path::to_path_buf).unwrap_or_default();
        let inflight = parent_dir.join(layout::inflight_name(&key, &previous_key));
        let consistent = parent_dir.join(layout::consistent_name(&key, &previous_key));

        self.fs.mkdir(&self.at(&parent_dir)).await?;
        // a temp left by an earlier failed attempt must not pollute this one
        self.fs.remove(&self.at(&inflight)).await?;
        self.fs.mkdir(&self.at(&inflight)).await?;

        // a folder carries its children through the rename
        if set.name() == FOLDERS_SET {
            if let Some(previous_dir) = previous_dir.as_deref() {
                if self.fs.exists(&self.at(previous_dir)).await? {
                    copy_tree(
                        self.fs.as_ref(),
                        &self.at(previous_dir),
                        &self.at(&inflight),
                        &|_| false,
                    )
                    .await?;
                }
            }
        }

        for property in set.document_properties() {
            let Some(value) = doc.field(property.path()) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let extension = self.resolvers.resolve(doc, set.name(), property);
            let file = inflight.join(format!("{}.{extension}", property.file_stem()));
            let bytes = match property.kind() {
                PropertyKind::Text => match value {
                    Value::String(text) => text.clone().into_bytes(),
                    other => codec::to_line_json(other)?.into_bytes(),
                },
                PropertyKind::Binary => codec::decode_binary(value).ok_or_else(|| {
                    StoreError::invalid_operation(format!(
                        "property {} is not valid base64",
                        property.path()
                    ))
                })?,
            };
            self.fs.write_file(&self.at(&file), &bytes).await?;
        }

        let descriptor = codec::to_pretty_json(&self.descriptor_value(doc, set))?;
        self.fs
            .write_file(
                &self.at(inflight.join(layout::DESCRIPTOR_FILE)),
                descriptor.as_bytes(),
            )
            .await?;

        // past this rename the write counts as committed
        self.rename_retrying(&inflight, &consistent).await?;

        if moving {
            if let Some(previous_dir) = previous_dir.as_deref() {
                if self.fs.exists(&self.at(previous_dir)).await? {
                    self.fs.remove(&self.at(previous_dir)).await?;
                }
            }
        }

        self.fs.remove(&self.at(&target_dir)).await?;
        self.rename_retrying(&consistent, &target_dir).await?;
        Ok(())
    }

    async fn rename_retrying(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let from = self.at(from);
        let to = self.at(to);
        retry(self.rename_retries, || async {
            Ok(self.fs.rename(&from, &to).await?)
        })
        .await
    }

    // ---- single-document refresh ---------------------------------------

    /// Re-reads one document from disk; `None` when it no longer exists.
    pub(crate) async fn reload(
        &self,
        entity_set: &str,
        id: &str,
        key: Option<&str>,
        folder_shortid: Option<&str>,
        all: &DocumentSet,
    ) -> StoreResult<Option<Document>> {
        let set = self.model.require(entity_set)?;
        if set.is_split() {
            let Some(key) = key else {
                return Ok(None);
            };
            let dir = self.folder_dir(folder_shortid, all)?.join(key);
            if !self.fs.exists(&self.at(&dir)).await? {
                return Ok(None);
            }
            let entries = self.dir_entries(&dir).await?;
            // the event already names the set, so a descriptor without
            // $entitySet still resolves
            let Some((mut doc, _)) =
                self.parse_document_dir(&dir, &entries, Some(entity_set)).await?
            else {
                return Ok(None);
            };
            doc.set_folder_shortid(folder_shortid);
            Ok(Some(doc))
        } else {
            Ok(self
                .load_flat_set(set)
                .await?
                .into_iter()
                .find(|doc| doc.id() == Some(id)))
        }
    }

    // ---- compaction ----------------------------------------------------

    /// Rewrites each flat file to exactly the live documents, skipping
    /// files whose content is already in that form.
    pub(crate) async fn compact(&self, all: &DocumentSet) -> StoreResult<()> {
        for set in self.model.flat_sets() {
            let docs = all.documents(set.name());
            let file = PathBuf::from(set.name());
            let exists = self.fs.exists(&self.at(&file)).await?;
            if docs.is_empty() && !exists {
                continue;
            }

            let mut desired = String::new();
            for doc in docs {
                desired.push_str(&codec::to_line_json(&self.flat_record(doc))?);
                desired.push('\n');
            }
            if exists {
                let current = self.fs.read_file(&self.at(&file)).await?;
                if current == desired.as_bytes() {
                    continue;
                }
            }

            let temp = PathBuf::from(layout::flat_temp_name(set.name()));
            self.fs
                .write_file(&self.at(&temp), desired.as_bytes())
                .await?;
            self.rename_retrying(&temp, &file).await?;
            debug!(
                target: "arbordb::persist",
                entity_set = set.name(),
                documents = docs.len(),
                "compacted flat file"
            );
        }
        Ok(())
    }

    // ---- loading -------------------------------------------------------

    /// Reads the whole tree into a fresh cache, resolving crash artifacts
    /// and synthesizing folder documents for ad hoc directories on the way.
    pub(crate) async fn load(&self) -> StoreResult<DocumentSet> {
        let mut loaded = DocumentSet::for_model(&self.model);

        // (directory, nearest ancestor folder directory, legacy set hint)
        let mut stack: Vec<(PathBuf, Option<PathBuf>, Option<String>)> =
            vec![(PathBuf::new(), None, None)];
        let mut pending: Vec<(PathBuf, Option<PathBuf>, Document)> = Vec::new();

        while let Some((dir, parent_folder, hint)) = stack.pop() {
            let entries = self.resolve_artifacts(&dir).await?;
            let is_root = dir.as_os_str().is_empty();
            let has_descriptor = entries
                .iter()
                .any(|(name, is_dir)| !is_dir && name == layout::DESCRIPTOR_FILE);

            let mut this_folder = parent_folder.clone();
            let mut child_hint = hint.clone();
            if !is_root {
                let dir_name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let legacy_container = !has_descriptor
                    && dir.parent().map(|p| p.as_os_str().is_empty()).unwrap_or(false)
                    && self
                        .model
                        .entity_set(&dir_name)
                        .map(EntitySet::is_split)
                        .unwrap_or(false);

                if has_descriptor {
                    if let Some((doc, is_folder)) =
                        self.parse_document_dir(&dir, &entries, hint.as_deref()).await?
                    {
                        if is_folder {
                            this_folder = Some(dir.clone());
                        }
                        pending.push((dir.clone(), parent_folder.clone(), doc));
                    }
                } else if legacy_container {
                    child_hint = Some(dir_name);
                } else if !entries.is_empty() {
                    let doc = self.synthesize_folder(&dir, &dir_name).await?;
                    this_folder = Some(dir.clone());
                    pending.push((dir.clone(), parent_folder.clone(), doc));
                }
            }

            for (name, is_dir) in entries.iter().rev() {
                if !is_dir || layout::is_reserved(name) || name.starts_with('~') {
                    continue;
                }
                stack.push((dir.join(name), this_folder.clone(), child_hint.clone()));
            }
        }

        // folder linkage runs over the full arena so order of discovery
        // does not matter
        let mut folder_ids: HashMap<PathBuf, String> = HashMap::new();
        for (dir, _, doc) in &mut pending {
            if doc.entity_set() != FOLDERS_SET {
                continue;
            }
            let shortid = match doc.str_field(SHORTID_FIELD) {
                Some(shortid) => shortid.to_string(),
                None => {
                    let healed = uid(8);
                    doc.body_mut()
                        .insert(SHORTID_FIELD.to_string(), Value::String(healed.clone()));
                    healed
                }
            };
            folder_ids.insert(dir.clone(), shortid);
        }
        for (_, parent_folder, mut doc) in pending {
            let shortid = parent_folder
                .as_ref()
                .and_then(|dir| folder_ids.get(dir))
                .map(String::as_str);
            doc.set_folder_shortid(shortid);
            loaded.push(doc);
        }

        for set in self.model.flat_sets() {
            for doc in self.load_flat_set(set).await? {
                loaded.push(doc);
            }
        }

        Ok(loaded)
    }

    async fn dir_entries(&self, dir: &Path) -> StoreResult<Vec<(String, bool)>> {
        let mut entries = Vec::new();
        for name in self.fs.list(&self.at(dir)).await? {
            let stat = self.fs.stat(&self.at(dir.join(&name))).await?;
            entries.push((name, stat.is_directory));
        }
        Ok(entries)
    }

    /// Applies the crash-artifact rules to one directory and returns its
    /// post-cleanup entries.
    async fn resolve_artifacts(&self, dir: &Path) -> StoreResult<Vec<(String, bool)>> {
        let entries = self.dir_entries(dir).await?;
        let mut changed = false;
        for (name, _) in &entries {
            match layout::classify_artifact(name) {
                None => {}
                Some(CrashArtifact::Abandoned) => {
                    debug!(target: "arbordb::persist", name = %name, "dropping abandoned write");
                    self.fs.remove(&self.at(dir.join(name))).await?;
                    changed = true;
                }
                Some(CrashArtifact::Consistent {
                    final_name,
                    previous_name,
                }) => {
                    debug!(
                        target: "arbordb::persist",
                        name = %name, final_name, "completing interrupted write"
                    );
                    self.fs.remove(&self.at(dir.join(previous_name))).await?;
                    self.fs.remove(&self.at(dir.join(final_name))).await?;
                    self.rename_retrying(&dir.join(name), &dir.join(final_name))
                        .await?;
                    changed = true;
                }
                Some(CrashArtifact::FlatTemp) => {
                    debug!(target: "arbordb::persist", name = %name, "dropping stale compaction temp");
                    self.fs.remove(&self.at(dir.join(name))).await?;
                    changed = true;
                }
            }
        }
        if changed {
            self.dir_entries(dir).await
        } else {
            Ok(entries)
        }
    }

    /// Parses one split document directory. `Ok(None)` skips directories
    /// whose descriptor names no known entity set.
    async fn parse_document_dir(
        &self,
        dir: &Path,
        entries: &[(String, bool)],
        hint: Option<&str>,
    ) -> StoreResult<Option<(Document, bool)>> {
        let descriptor_path = dir.join(layout::DESCRIPTOR_FILE);
        let bytes = self.fs.read_file(&self.at(&descriptor_path)).await?;
        let mut body: JsonMap = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::corrupt_descriptor(descriptor_path, source))?;

        let declared = body
            .remove(ENTITY_SET_FIELD)
            .and_then(|value| value.as_str().map(str::to_string));
        let set_name = match declared.or_else(|| hint.map(str::to_string)) {
            Some(name) => name,
            None => {
                warn!(
                    target: "arbordb::persist",
                    path = %dir.display(),
                    "descriptor does not name an entity set, skipping"
                );
                return Ok(None);
            }
        };
        let Some(set) = self.model.entity_set(&set_name) else {
            warn!(
                target: "arbordb::persist",
                path = %dir.display(),
                entity_set = %set_name,
                "unknown entity set, skipping"
            );
            return Ok(None);
        };

        // the directory name is the authority for the public key
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(key_field) = set.public_key() {
            body.insert(key_field.to_string(), Value::String(dir_name));
        }

        for property in set.document_properties() {
            let stem = property.file_stem();
            let dotted = format!("{stem}.");
            let mut matches = entries.iter().filter(|(name, is_dir)| {
                !is_dir
                    && name != layout::DESCRIPTOR_FILE
                    && (name == stem || name.starts_with(&dotted))
            });
            let Some((file_name, _)) = matches.next() else {
                continue;
            };
            if matches.next().is_some() {
                return Err(StoreError::invalid_operation(format!(
                    "multiple files match document property {} in {}",
                    property.path(),
                    dir.display()
                )));
            }
            let bytes = self.fs.read_file(&self.at(dir.join(file_name))).await?;
            let value = match property.kind() {
                PropertyKind::Text => {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                PropertyKind::Binary => codec::encode_binary(&bytes),
            };
            deep_set(&mut body, property.path(), value);
        }

        let is_folder = set.name() == FOLDERS_SET;
        Ok(Some((Document::with_etag(set.name(), body, 0), is_folder)))
    }

    /// Turns an ad hoc directory into a folder document and writes its
    /// descriptor back so the next load finds a stable identity.
    async fn synthesize_folder(&self, dir: &Path, name: &str) -> StoreResult<Document> {
        debug!(
            target: "arbordb::persist",
            path = %dir.display(),
            "adopting directory as a folder"
        );
        let mut body = JsonMap::new();
        body.insert(ID_FIELD.to_string(), Value::String(uid(16)));
        body.insert(
            crate::model::FOLDERS_KEY.to_string(),
            Value::String(name.to_string()),
        );
        body.insert(SHORTID_FIELD.to_string(), Value::String(uid(8)));
        let doc = Document::new(FOLDERS_SET, body);

        let set = self.model.require(FOLDERS_SET)?;
        let descriptor = codec::to_pretty_json(&self.descriptor_value(&doc, set))?;
        self.fs
            .write_file(
                &self.at(dir.join(layout::DESCRIPTOR_FILE)),
                descriptor.as_bytes(),
            )
            .await?;
        Ok(doc)
    }

    async fn load_flat_set(&self, set: &EntitySet) -> StoreResult<Vec<Document>> {
        let file = PathBuf::from(set.name());
        if !self.fs.exists(&self.at(&file)).await? {
            return Ok(Vec::new());
        }
        let bytes = self.fs.read_file(&self.at(&file)).await?;
        let text = String::from_utf8_lossy(&bytes);

        let mut docs: Vec<Document> = Vec::new();
        let mut total = 0usize;
        let mut corrupt = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            total += 1;
            let mut body: JsonMap = match serde_json::from_str(line) {
                Ok(body) => body,
                Err(_) => {
                    corrupt += 1;
                    continue;
                }
            };
            if body.get(DELETED_FIELD).and_then(Value::as_bool) == Some(true) {
                if let Some(id) = body.get(ID_FIELD).and_then(Value::as_str) {
                    if let Some(position) = docs.iter().position(|d| d.id() == Some(id)) {
                        docs.remove(position);
                    }
                }
                continue;
            }
            let doc = Document::new(set.name(), body);
            let position = doc
                .id()
                .and_then(|id| docs.iter().position(|d| d.id() == Some(id)));
            match position {
                Some(position) => docs[position] = doc,
                None => docs.push(doc),
            }
        }

        if total > 0 && corrupt as f64 / total as f64 > self.corrupt_alert_threshold {
            return Err(StoreError::CorruptFlatFile {
                entity_set: set.name().to_string(),
                corrupt,
                total,
            });
        }
        if corrupt > 0 {
            warn!(
                target: "arbordb::persist",
                entity_set = set.name(),
                corrupt,
                total,
                "skipped corrupt flat records"
            );
        }
        Ok(docs)
    }
}

/// Recursively copies `from` into `to` through the backend primitives.
/// `skip_top` filters top-level names only.
pub(crate) async fn copy_tree(
    fs: &dyn FsBackend,
    from: &Path,
    to: &Path,
    skip_top: &(dyn Fn(&str) -> bool + Sync),
) -> StoreResult<()> {
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf(), true)];
    while let Some((src, dst, is_top)) = stack.pop() {
        fs.mkdir(&dst).await?;
        for name in fs.list(&src).await? {
            if is_top && skip_top(&name) {
                continue;
            }
            let child_src = src.join(&name);
            let child_dst = dst.join(&name);
            if fs.stat(&child_src).await?.is_directory {
                stack.push((child_src, child_dst, false));
            } else {
                let bytes = fs.read_file(&child_src).await?;
                fs.write_file(&child_dst, &bytes).await?;
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod load_tests {
    use serde_json::json;
    use tempfile::TempDir;

    use arbordb_fs::DirectoryFs;

    use crate::model::DocumentModel;

    use super::*;

    fn model() -> Arc<DocumentModel> {
        Arc::new(
            DocumentModel::builder()
                .split_set("templates", "name", |set| set.text_property("content", "html"))
                .flat_set("settings")
                .build()
                .unwrap(),
        )
    }

    async fn engine_over(existing: &TempDir) -> (Arc<dyn FsBackend>, Persistence) {
        let fs: Arc<dyn FsBackend> = Arc::new(DirectoryFs::new(existing.path().join("data")));
        fs.init().await.unwrap();
        let persistence = Persistence::new(
            Arc::clone(&fs),
            model(),
            Arc::new(ResolverChain::default()),
            10,
            0.1,
        );
        (fs, persistence)
    }

    fn seed(dir: &TempDir, rel: &str, value: serde_json::Value) {
        let path = dir.path().join("data").join(rel);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("config.json"), value.to_string()).unwrap();
    }

    #[tokio::test]
    async fn completes_interrupted_writes_and_drops_abandoned_ones() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, "c", json!({"$entitySet": "templates", "_id": "1", "state": "old"}));
        seed(&dir, "~c~c", json!({"$entitySet": "templates", "_id": "1", "state": "new"}));
        seed(&dir, "~~lost~lost", json!({"$entitySet": "templates", "_id": "2"}));
        std::fs::write(dir.path().join("data/~settings"), "garbage").unwrap();

        let (fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();

        let templates = loaded.documents("templates");
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].field("state"), Some(&json!("new")));

        assert!(fs.exists(Path::new("c/config.json")).await.unwrap());
        assert!(!fs.exists(Path::new("~c~c")).await.unwrap());
        assert!(!fs.exists(Path::new("~~lost~lost")).await.unwrap());
        assert!(!fs.exists(Path::new("~settings")).await.unwrap());
    }

    #[tokio::test]
    async fn links_documents_through_nested_folders() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, "a", json!({"$entitySet": "folders", "_id": "fa", "shortid": "sa"}));
        seed(&dir, "a/b", json!({"$entitySet": "folders", "_id": "fb", "shortid": "sb"}));
        seed(&dir, "a/b/t", json!({"$entitySet": "templates", "_id": "t1"}));
        std::fs::write(dir.path().join("data/a/b/t/content.html"), "payload").unwrap();

        let (_fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();

        let template = loaded.find_by_id("templates", "t1").unwrap();
        assert_eq!(template.field("name"), Some(&json!("t")));
        assert_eq!(template.folder_shortid(), Some("sb"));
        assert_eq!(template.field("content"), Some(&json!("payload")));

        let inner = loaded.find_by_id("folders", "fb").unwrap();
        assert_eq!(inner.field("name"), Some(&json!("b")));
        assert_eq!(inner.folder_shortid(), Some("sa"));

        let outer = loaded.find_by_id("folders", "fa").unwrap();
        assert_eq!(outer.folder_shortid(), None);
    }

    #[tokio::test]
    async fn adopts_ad_hoc_directories_as_folders() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, "shared/t", json!({"$entitySet": "templates", "_id": "t1"}));

        let (fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();

        let folders = loaded.documents("folders");
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].field("name"), Some(&json!("shared")));
        let shortid = folders[0].field("shortid").unwrap().as_str().unwrap();

        let template = loaded.find_by_id("templates", "t1").unwrap();
        assert_eq!(template.folder_shortid(), Some(shortid));

        // the adopted folder now has a persisted identity
        assert!(fs.exists(Path::new("shared/config.json")).await.unwrap());
    }

    #[tokio::test]
    async fn reads_legacy_set_container_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/templates/foo")).unwrap();
        std::fs::write(
            dir.path().join("data/templates/foo/config.json"),
            json!({"_id": "t1", "engine": "fast"}).to_string(),
        )
        .unwrap();

        let (_fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();

        let template = loaded.find_by_id("templates", "t1").unwrap();
        assert_eq!(template.entity_set(), "templates");
        assert_eq!(template.field("name"), Some(&json!("foo")));
        assert!(loaded.documents("folders").is_empty(), "container is not a folder");
    }

    #[tokio::test]
    async fn skips_unknown_entity_sets() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, "mystery", json!({"$entitySet": "widgets", "_id": "w1"}));
        seed(&dir, "real", json!({"$entitySet": "templates", "_id": "t1"}));

        let (_fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();

        assert!(loaded.find_by_id("templates", "t1").is_some());
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_descriptor_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/broken");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("config.json"), "{not json").unwrap();

        let (_fs, persistence) = engine_over(&dir).await;
        let err = persistence.load().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptDescriptor { .. }), "{err}");
    }

    #[tokio::test]
    async fn corrupt_flat_lines_stop_the_load_past_the_threshold() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();

        // 1 bad line in 20 stays under the default 10% threshold
        let mut mostly_fine = String::new();
        for index in 0..19 {
            mostly_fine.push_str(&json!({"_id": format!("s{index}")}).to_string());
            mostly_fine.push('\n');
        }
        mostly_fine.push_str("oops\n");
        std::fs::write(dir.path().join("data/settings"), &mostly_fine).unwrap();

        let (_fs, persistence) = engine_over(&dir).await;
        let loaded = persistence.load().await.unwrap();
        assert_eq!(loaded.documents("settings").len(), 19);

        // 2 bad lines in 5 is beyond it
        std::fs::write(
            dir.path().join("data/settings"),
            "oops\n{\"_id\":\"a\"}\nbroken\n{\"_id\":\"b\"}\n{\"_id\":\"c\"}\n",
        )
        .unwrap();
        let err = persistence.load().await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptFlatFile { .. }), "{err}");
    }
}
