//! The local document store contract.
//!
//! Everything above this module talks to storage through [`DocumentStore`]
//! and obtains stores through a [`StoreOpener`]. Two backends implement
//! it: [`crate::lmdb_store::LmdbStore`] for on-device persistence and
//! [`crate::memory_store::MemoryStore`] for process-local data.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::local_doc::{LocalDoc, DESIGN_PREFIX};
use crate::sync_error::{Result, SyncError};

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    pub id: String,
    pub rev: String,
}

/// What a view emits for every live document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewEmit {
    /// `(doc._id, doc._rev)` once per document.
    IdToCurrentRevision,
    /// `(doc._id, rev)` for every revision on the document's path, newest first.
    IdToRevisions,
}

/// A named view, persisted as the design document `_design/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub emit: ViewEmit,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, emit: ViewEmit) -> Self {
        Self {
            name: name.into(),
            emit,
        }
    }

    pub fn design_id(&self) -> String {
        format!("{DESIGN_PREFIX}{}", self.name)
    }

    fn to_doc(&self) -> LocalDoc {
        let mut views = Map::new();
        views.insert(self.name.clone(), json!({ "emit": self.emit }));

        let mut body = Map::new();
        body.insert("language".to_string(), json!("builtin"));
        body.insert("views".to_string(), JsonValue::Object(views));
        LocalDoc::new(self.design_id(), body)
    }

    fn from_doc(name: &str, doc: &LocalDoc) -> Result<Self> {
        let emit = doc
            .body
            .get("views")
            .and_then(|views| views.get(name))
            .and_then(|view| view.get("emit"))
            .cloned()
            .ok_or_else(|| SyncError::Corrupted(format!("design document {} has no view {name}", doc.id)))?;
        Ok(Self {
            name: name.to_string(),
            emit: serde_json::from_value(emit)?,
        })
    }

    fn emit_rows(&self, doc: &LocalDoc, rows: &mut Vec<ViewRow>) {
        match self.emit {
            ViewEmit::IdToCurrentRevision => {
                if let Some(rev) = &doc.rev {
                    rows.push(ViewRow {
                        id: doc.id.clone(),
                        key: json!(doc.id),
                        value: json!(rev),
                    });
                }
            }
            ViewEmit::IdToRevisions => {
                for rev in doc.revision_history() {
                    rows.push(ViewRow {
                        id: doc.id.clone(),
                        key: json!(doc.id),
                        value: json!(rev),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: JsonValue,
    pub value: JsonValue,
}

/// A named, revision-tagged document database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Reads a live document. Absent and deleted documents are `NotFound`.
    async fn get(&self, id: &str) -> Result<LocalDoc>;

    /// Reads a document including tombstones.
    async fn get_any(&self, id: &str) -> Result<Option<LocalDoc>>;

    /// Writes under optimistic concurrency, see [`crate::local_doc::prepare_write`].
    async fn put(&self, doc: LocalDoc) -> Result<PutResponse>;

    /// Writes a revision produced elsewhere. Returns whether it was stored.
    async fn put_replicated(&self, doc: LocalDoc) -> Result<bool>;

    /// Live, non-design documents in id order.
    async fn all_docs(&self) -> Result<Vec<LocalDoc>>;

    /// Every document, tombstones and design documents included.
    async fn changes(&self) -> Result<Vec<LocalDoc>>;

    /// Removes all data held by this store.
    async fn destroy(&self) -> Result<()>;

    /// Replaces a live document with a tombstone.
    async fn remove(&self, id: &str, rev: &str) -> Result<PutResponse> {
        let mut tombstone = LocalDoc::new(id, Map::new());
        tombstone.rev = Some(rev.to_string());
        tombstone.deleted = true;
        self.put(tombstone).await
    }

    /// Creates a view. An existing view with the same name is a `Conflict`.
    async fn put_view(&self, view: &ViewDefinition) -> Result<PutResponse> {
        self.put(view.to_doc()).await
    }

    /// Evaluates a previously created view over all live documents.
    async fn query_view(&self, name: &str) -> Result<Vec<ViewRow>> {
        let design_id = format!("{DESIGN_PREFIX}{name}");
        let design = match self.get(&design_id).await {
            Ok(doc) => doc,
            Err(SyncError::NotFound(_)) => {
                return Err(SyncError::NotFound(format!("view {name} does not exist in {}", self.name())))
            }
            Err(e) => return Err(e),
        };
        let view = ViewDefinition::from_doc(name, &design)?;

        let mut rows = Vec::new();
        for doc in self.all_docs().await? {
            view.emit_rows(&doc, &mut rows);
        }
        Ok(rows)
    }
}

/// Opens (creating if needed) a document store by name.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>>;
}

pub(crate) fn not_found(store: &str, id: &str) -> SyncError {
    SyncError::NotFound(format!("document {id} not found in {store}"))
}
