//! Documents and the in-memory cache they live in.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::model::{DocumentModel, FOLDERS_SET};

/// JSON object type used for document bodies.
pub type JsonMap = Map<String, Value>;

/// Field holding the document id.
pub(crate) const ID_FIELD: &str = "_id";
/// Field holding the weak parent-folder reference.
pub(crate) const FOLDER_FIELD: &str = "folder";
/// Field inside the folder reference (and on folder documents themselves).
pub(crate) const SHORTID_FIELD: &str = "shortid";
/// Descriptor and flat-record field naming the owning entity set.
pub(crate) const ENTITY_SET_FIELD: &str = "$entitySet";
/// Revision stamp field, stripped wherever it shows up in raw input.
pub(crate) const ETAG_FIELD: &str = "$$etag";
/// Tombstone field in flat files.
pub(crate) const DELETED_FIELD: &str = "$$deleted";

/// Milliseconds since the Unix epoch; the etag clock.
pub(crate) fn etag_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Random lowercase-hex identifier of `len` characters.
pub(crate) fn uid(len: usize) -> String {
    let mut out = String::with_capacity(len + 32);
    while out.len() < len {
        out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    out.truncate(len);
    out
}

/// One document plus the bookkeeping the store attaches to it.
///
/// The body is plain JSON and is what callers get back (`_id` and `folder`
/// live in the body). The owning entity set and the revision stamp are
/// kept outside the body so they are never persisted or returned by
/// accident.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    entity_set: String,
    etag: u64,
    body: JsonMap,
}

impl Document {
    /// Creates a document, stripping stray internal fields from the body.
    pub fn new(entity_set: impl Into<String>, mut body: JsonMap) -> Self {
        body.remove(ENTITY_SET_FIELD);
        body.remove(ETAG_FIELD);
        Self {
            entity_set: entity_set.into(),
            etag: 0,
            body,
        }
    }

    pub(crate) fn with_etag(entity_set: impl Into<String>, body: JsonMap, etag: u64) -> Self {
        let mut doc = Self::new(entity_set, body);
        doc.etag = etag;
        doc
    }

    /// Name of the entity set this document belongs to.
    pub fn entity_set(&self) -> &str {
        &self.entity_set
    }

    /// Revision stamp (epoch milliseconds) of the last local mutation;
    /// zero for documents loaded from disk and never touched since.
    pub fn etag(&self) -> u64 {
        self.etag
    }

    pub(crate) fn set_etag(&mut self, etag: u64) {
        self.etag = etag;
    }

    /// Stamps the document with the current time.
    pub(crate) fn touch(&mut self) {
        self.etag = etag_now();
    }

    /// The document id, when present.
    pub fn id(&self) -> Option<&str> {
        self.body.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Returns the id, assigning a fresh one first if the body has none.
    pub(crate) fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let id = uid(16);
        self.body
            .insert(ID_FIELD.to_string(), Value::String(id.clone()));
        id
    }

    /// Borrow of the body.
    pub fn body(&self) -> &JsonMap {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut JsonMap {
        &mut self.body
    }

    /// Consumes the document, returning the body.
    pub fn into_body(self) -> JsonMap {
        self.body
    }

    /// Field lookup supporting dotted paths.
    pub fn field(&self, path: &str) -> Option<&Value> {
        deep_get(&self.body, path)
    }

    /// String value of a top-level field.
    pub(crate) fn str_field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    /// Short id of the parent folder, when the document is nested.
    pub fn folder_shortid(&self) -> Option<&str> {
        self.body.get(FOLDER_FIELD)?.get(SHORTID_FIELD)?.as_str()
    }

    /// Rewrites the parent-folder reference; `None` moves the document to
    /// the root.
    pub(crate) fn set_folder_shortid(&mut self, shortid: Option<&str>) {
        match shortid {
            Some(shortid) => {
                let mut folder = JsonMap::new();
                folder.insert(
                    SHORTID_FIELD.to_string(),
                    Value::String(shortid.to_string()),
                );
                self.body
                    .insert(FOLDER_FIELD.to_string(), Value::Object(folder));
            }
            None => {
                self.body.remove(FOLDER_FIELD);
            }
        }
    }
}

/// The in-memory cache: every known document, bucketed by entity set in
/// load order. Cloning is a deep copy of all bodies, which is exactly
/// what transaction staging relies on.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    sets: HashMap<String, Vec<Document>>,
}

impl DocumentSet {
    /// Empty cache with one bucket per modeled entity set.
    pub(crate) fn for_model(model: &DocumentModel) -> Self {
        let sets = model
            .entity_sets()
            .map(|set| (set.name().to_string(), Vec::new()))
            .collect();
        Self { sets }
    }

    /// Documents of one entity set; empty for unknown names.
    pub fn documents(&self, entity_set: &str) -> &[Document] {
        self.sets.get(entity_set).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn push(&mut self, doc: Document) {
        self.sets
            .entry(doc.entity_set().to_string())
            .or_default()
            .push(doc);
    }

    pub(crate) fn find_by_id(&self, entity_set: &str, id: &str) -> Option<&Document> {
        self.documents(entity_set).iter().find(|d| d.id() == Some(id))
    }

    pub(crate) fn find_by_id_mut(&mut self, entity_set: &str, id: &str) -> Option<&mut Document> {
        self.sets
            .get_mut(entity_set)?
            .iter_mut()
            .find(|d| d.id() == Some(id))
    }

    pub(crate) fn remove_by_id(&mut self, entity_set: &str, id: &str) -> Option<Document> {
        let docs = self.sets.get_mut(entity_set)?;
        let index = docs.iter().position(|d| d.id() == Some(id))?;
        Some(docs.remove(index))
    }

    /// Folder document carrying the given short id.
    pub(crate) fn folder_by_shortid(&self, shortid: &str) -> Option<&Document> {
        self.documents(FOLDERS_SET)
            .iter()
            .find(|d| d.str_field(SHORTID_FIELD) == Some(shortid))
    }

    /// All documents across all sets.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sets.values().flatten()
    }

    /// Total number of cached documents.
    pub fn len(&self) -> usize {
        self.sets.values().map(Vec::len).sum()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Looks up a dotted path (`a.b.c`) in a JSON object.
pub(crate) fn deep_get<'a>(map: &'a JsonMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut value = map.get(segments.next()?)?;
    for segment in segments {
        value = value.as_object()?.get(segment)?;
    }
    Some(value)
}

/// Assigns a dotted path, creating (or replacing non-object) intermediate
/// objects along the way.
pub(crate) fn deep_set(map: &mut JsonMap, path: &str, new_value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), new_value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(JsonMap::new()));
            if !slot.is_object() {
                *slot = Value::Object(JsonMap::new());
            }
            if let Some(child) = slot.as_object_mut() {
                deep_set(child, rest, new_value);
            }
        }
    }
}

/// Removes a dotted path, pruning intermediate objects it leaves empty.
pub(crate) fn deep_delete(map: &mut JsonMap, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            let now_empty = match map.get_mut(head).and_then(Value::as_object_mut) {
                Some(child) => {
                    deep_delete(child, rest);
                    child.is_empty()
                }
                None => false,
            };
            if now_empty {
                map.remove(head);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn new_strips_internal_fields() {
        let doc = Document::new(
            "templates",
            body(json!({"name": "a", "$entitySet": "x", "$$etag": 99})),
        );
        assert!(doc.body().get(ENTITY_SET_FIELD).is_none());
        assert!(doc.body().get(ETAG_FIELD).is_none());
        assert_eq!(doc.etag(), 0);
    }

    #[test]
    fn ensure_id_assigns_once() {
        let mut doc = Document::new("templates", body(json!({"name": "a"})));
        let id = doc.ensure_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(doc.ensure_id(), id);
    }

    #[test]
    fn folder_reference() {
        let mut doc = Document::new("templates", body(json!({"name": "a"})));
        assert_eq!(doc.folder_shortid(), None);

        doc.set_folder_shortid(Some("f1"));
        assert_eq!(doc.folder_shortid(), Some("f1"));
        assert_eq!(doc.body()["folder"], json!({"shortid": "f1"}));

        doc.set_folder_shortid(None);
        assert_eq!(doc.folder_shortid(), None);
        assert!(doc.body().get(FOLDER_FIELD).is_none());
    }

    #[test]
    fn deep_path_operations() {
        let mut map = body(json!({"a": {"b": 1}, "plain": true}));

        assert_eq!(deep_get(&map, "a.b"), Some(&json!(1)));
        assert_eq!(deep_get(&map, "a.missing"), None);
        assert_eq!(deep_get(&map, "plain"), Some(&json!(true)));

        deep_set(&mut map, "a.c.d", json!("x"));
        assert_eq!(deep_get(&map, "a.c.d"), Some(&json!("x")));

        // a non-object intermediate gets replaced
        deep_set(&mut map, "plain.inner", json!(2));
        assert_eq!(deep_get(&map, "plain.inner"), Some(&json!(2)));

        deep_delete(&mut map, "a.c.d");
        assert_eq!(deep_get(&map, "a.c"), None, "empty parent pruned");
        assert!(map.contains_key("a"));

        deep_delete(&mut map, "a.b");
        assert!(!map.contains_key("a"));
    }

    #[test]
    fn uid_lengths() {
        assert_eq!(uid(16).len(), 16);
        assert_eq!(uid(8).len(), 8);
        // longer than one uuid worth of hex
        assert_eq!(uid(40).len(), 40);
        assert_ne!(uid(16), uid(16));
    }

    #[test]
    fn set_lookup_and_removal() {
        let mut docs = DocumentSet::default();
        let mut folder = Document::new("folders", body(json!({"name": "f", "shortid": "s1"})));
        let folder_id = folder.ensure_id();
        docs.push(folder);

        let mut doc = Document::new("templates", body(json!({"name": "t"})));
        let doc_id = doc.ensure_id();
        docs.push(doc);

        assert_eq!(docs.len(), 2);
        assert!(docs.find_by_id("templates", &doc_id).is_some());
        assert!(docs.folder_by_shortid("s1").is_some());
        assert!(docs.folder_by_shortid("nope").is_none());

        assert!(docs.remove_by_id("templates", &doc_id).is_some());
        assert!(docs.find_by_id("templates", &doc_id).is_none());
        assert!(docs.find_by_id("folders", &folder_id).is_some());
    }
}
