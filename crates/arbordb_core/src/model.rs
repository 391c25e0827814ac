//! Entity-set model: which collections exist and how each one is stored.

use crate::error::{StoreError, StoreResult};

/// Name of the reserved folder entity set. A split set keyed by
/// [`FOLDERS_KEY`] is added automatically when the model does not declare
/// one.
pub const FOLDERS_SET: &str = "folders";

/// Public-key field of the folder entity set.
pub(crate) const FOLDERS_KEY: &str = "name";

/// How the values of one document property reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// UTF-8 text, stored verbatim.
    Text,
    /// Binary payload: base64 inside the document, raw bytes on disk.
    Binary,
}

/// A field persisted as its own sibling file instead of in the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentProperty {
    path: String,
    extension: String,
    kind: PropertyKind,
}

impl DocumentProperty {
    fn new(path: impl Into<String>, extension: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            path: path.into(),
            extension: extension.into(),
            kind,
        }
    }

    /// Dotted path of the field inside the document.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extension used when no resolver claims the property.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Storage kind.
    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Final segment of the dotted path; doubles as the property file's stem.
    pub(crate) fn file_stem(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// One named collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySet {
    name: String,
    split: bool,
    public_key: Option<String>,
    properties: Vec<DocumentProperty>,
}

impl EntitySet {
    /// Set name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for one-directory-per-document storage.
    pub fn is_split(&self) -> bool {
        self.split
    }

    /// The natural-key field of a split set.
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// Properties persisted as sibling files.
    pub fn document_properties(&self) -> &[DocumentProperty] {
        &self.properties
    }
}

/// The complete entity-set model of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentModel {
    sets: Vec<EntitySet>,
}

impl DocumentModel {
    /// Starts a builder.
    pub fn builder() -> DocumentModelBuilder {
        DocumentModelBuilder::default()
    }

    /// The entity set named `name`.
    pub fn entity_set(&self, name: &str) -> Option<&EntitySet> {
        self.sets.iter().find(|set| set.name == name)
    }

    pub(crate) fn require(&self, name: &str) -> StoreResult<&EntitySet> {
        self.entity_set(name)
            .ok_or_else(|| StoreError::unknown_entity_set(name))
    }

    /// All entity sets in declaration order.
    pub fn entity_sets(&self) -> impl Iterator<Item = &EntitySet> {
        self.sets.iter()
    }

    pub(crate) fn flat_sets(&self) -> impl Iterator<Item = &EntitySet> {
        self.sets.iter().filter(|set| !set.split)
    }
}

/// Builder for [`DocumentModel`].
#[derive(Debug, Default)]
pub struct DocumentModelBuilder {
    sets: Vec<EntitySet>,
}

impl DocumentModelBuilder {
    /// Adds a split entity set keyed by `public_key`. The closure
    /// configures the set's document properties; pass `|set| set` for none.
    #[must_use]
    pub fn split_set(
        mut self,
        name: impl Into<String>,
        public_key: impl Into<String>,
        configure: impl FnOnce(EntitySetBuilder) -> EntitySetBuilder,
    ) -> Self {
        let properties = configure(EntitySetBuilder::default()).properties;
        self.sets.push(EntitySet {
            name: name.into(),
            split: true,
            public_key: Some(public_key.into()),
            properties,
        });
        self
    }

    /// Adds a flat (append-log) entity set.
    #[must_use]
    pub fn flat_set(mut self, name: impl Into<String>) -> Self {
        self.sets.push(EntitySet {
            name: name.into(),
            split: false,
            public_key: None,
            properties: Vec::new(),
        });
        self
    }

    /// Validates the declarations and builds the model.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidModel`] for empty or duplicate set names, an
    /// empty public key, colliding property file stems, or a `folders`
    /// declaration that is not a split set keyed by `name`.
    pub fn build(mut self) -> StoreResult<DocumentModel> {
        if self.sets.iter().all(|set| set.name != FOLDERS_SET) {
            self.sets.push(EntitySet {
                name: FOLDERS_SET.to_string(),
                split: true,
                public_key: Some(FOLDERS_KEY.to_string()),
                properties: Vec::new(),
            });
        }

        for (index, set) in self.sets.iter().enumerate() {
            if set.name.is_empty() {
                return Err(StoreError::invalid_model("entity set name must not be empty"));
            }
            if self.sets[..index].iter().any(|other| other.name == set.name) {
                return Err(StoreError::invalid_model(format!(
                    "duplicate entity set: {}",
                    set.name
                )));
            }
            if set.split && set.public_key.as_deref().unwrap_or("").is_empty() {
                return Err(StoreError::invalid_model(format!(
                    "split set {} needs a non-empty public key",
                    set.name
                )));
            }
            for (p_index, property) in set.properties.iter().enumerate() {
                if property.path.is_empty() {
                    return Err(StoreError::invalid_model(format!(
                        "empty property path in set {}",
                        set.name
                    )));
                }
                let stem = property.file_stem();
                if set.properties[..p_index]
                    .iter()
                    .any(|other| other.file_stem() == stem)
                {
                    return Err(StoreError::invalid_model(format!(
                        "property file stem {stem} declared twice in set {}",
                        set.name
                    )));
                }
            }
        }

        let folders = self
            .sets
            .iter()
            .find(|set| set.name == FOLDERS_SET)
            .filter(|set| set.split && set.public_key.as_deref() == Some(FOLDERS_KEY));
        if folders.is_none() {
            return Err(StoreError::invalid_model(
                "folders must be a split set keyed by name",
            ));
        }

        Ok(DocumentModel { sets: self.sets })
    }
}

/// Per-set builder handed to [`DocumentModelBuilder::split_set`].
#[derive(Debug, Default)]
pub struct EntitySetBuilder {
    properties: Vec<DocumentProperty>,
}

impl EntitySetBuilder {
    /// Adds a text document property at a dotted path.
    #[must_use]
    pub fn text_property(
        mut self,
        path: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        self.properties
            .push(DocumentProperty::new(path, extension, PropertyKind::Text));
        self
    }

    /// Adds a binary document property at a dotted path.
    #[must_use]
    pub fn binary_property(
        mut self,
        path: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        self.properties
            .push(DocumentProperty::new(path, extension, PropertyKind::Binary));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_and_adds_folders() {
        let model = DocumentModel::builder()
            .split_set("templates", "name", |set| {
                set.text_property("content", "html")
                    .text_property("phantom.header", "html")
            })
            .flat_set("settings")
            .build()
            .unwrap();

        let templates = model.entity_set("templates").unwrap();
        assert!(templates.is_split());
        assert_eq!(templates.public_key(), Some("name"));
        assert_eq!(templates.document_properties().len(), 2);
        assert_eq!(templates.document_properties()[1].file_stem(), "header");

        let folders = model.entity_set(FOLDERS_SET).unwrap();
        assert!(folders.is_split());
        assert_eq!(folders.public_key(), Some("name"));

        assert_eq!(model.flat_sets().count(), 1);
    }

    #[test]
    fn explicit_folders_declaration_is_kept() {
        let model = DocumentModel::builder()
            .split_set("folders", "name", |set| set)
            .build()
            .unwrap();
        assert_eq!(model.entity_sets().count(), 1);
    }

    #[test]
    fn rejects_duplicate_sets() {
        let err = DocumentModel::builder()
            .flat_set("settings")
            .flat_set("settings")
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidModel { .. }));
    }

    #[test]
    fn rejects_colliding_property_stems() {
        let err = DocumentModel::builder()
            .split_set("templates", "name", |set| {
                set.text_property("content", "html")
                    .text_property("phantom.content", "js")
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidModel { .. }));
    }

    #[test]
    fn rejects_flat_folders() {
        let err = DocumentModel::builder().flat_set("folders").build().unwrap_err();
        assert!(matches!(err, StoreError::InvalidModel { .. }));
    }
}
