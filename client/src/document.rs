//! Document handles.
//!
//! A [`Document`] is a mutable, caller-owned view of one document: its id, the
//! revision it was loaded at (shared, immutable) and a JSON object body. Saving
//! binds the handle to the database that stored it.

use harbor_engine::{Generation, Revision, RevisionId};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Identity of an open database instance.
pub type DatabaseId = Uuid;

/// A document handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    revision: Option<Arc<Revision>>,
    deleted: bool,
    body: Map<String, Value>,
    database: Option<DatabaseId>,
}

impl Document {
    /// A new, unsaved, empty document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            deleted: false,
            body: Map::new(),
            database: None,
        }
    }

    /// A new, unsaved document with the given body. Non-object values are
    /// ignored and leave the body empty.
    pub fn with_body(id: impl Into<String>, body: Value) -> Self {
        let mut doc = Self::new(id);
        if let Value::Object(map) = body {
            doc.body = map;
        }
        doc
    }

    pub(crate) fn from_revision(revision: Arc<Revision>, database: DatabaseId) -> Self {
        let body = revision.body.as_object().cloned().unwrap_or_default();
        Self {
            id: revision.doc_id.clone(),
            deleted: revision.is_deleted(),
            revision: Some(revision),
            body,
            database: Some(database),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision this handle was loaded or last saved at.
    pub fn revision(&self) -> Option<&Arc<Revision>> {
        self.revision.as_ref()
    }

    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.revision.as_ref().map(|r| &r.rev_id)
    }

    /// Generation of the loaded revision; 0 for unsaved documents.
    pub fn generation(&self) -> Generation {
        self.revision.as_ref().map_or(0, |r| r.generation())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Database the handle is bound to, once saved or loaded.
    pub fn database_id(&self) -> Option<DatabaseId> {
        self.database
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.body
    }

    /// Body as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    pub(crate) fn adopt_revision(&mut self, revision: Arc<Revision>, database: DatabaseId) {
        self.deleted = revision.is_deleted();
        self.revision = Some(revision);
        self.database = Some(database);
    }

    pub(crate) fn mark_deleted(&mut self, database: DatabaseId) {
        self.deleted = true;
        self.database = Some(database);
    }

    /// Unbound copy of the body under another id.
    pub(crate) fn renamed(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            revision: None,
            deleted: false,
            body: self.body.clone(),
            database: None,
        }
    }
}
