//! Typed access to the records of a project.
//!
//! Records are addressed by the project's active id and stored in its data
//! store in [`EncodedObservation`] form. Writes are not retried: a stale
//! revision comes back as `SaveFailed` wrapping the `Conflict`, and the
//! caller decides whether to re-read and try again.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use uuid::Uuid;

use crate::datamodel::{EncodedObservation, Observation, RecordId, RevisionId, OBSERVATION_FORMAT_VERSION};
use crate::doc_store::{DocumentStore, PutResponse, ViewDefinition, ViewEmit};
use crate::local_doc::LocalDoc;
use crate::registry::DatabaseRegistry;
use crate::sync_error::{Result, SyncError};

/// Emits every `(record id, revision)` pair of a data store.
pub const REVISIONS_VIEW_NAME: &str = "list_all_data_rev";

/// Record id to every revision seen for it, newest first.
pub type RevisionListing = BTreeMap<RecordId, Vec<RevisionId>>;

pub fn generate_record_id() -> RecordId {
    Uuid::new_v4().to_string()
}

pub struct RecordStorage {
    registry: Arc<DatabaseRegistry>,
}

impl RecordStorage {
    pub fn new(registry: Arc<DatabaseRegistry>) -> Self {
        Self { registry }
    }

    pub fn generate_record_id(&self) -> RecordId {
        generate_record_id()
    }

    /// Creates the record, or updates it when `record.rev` is set.
    pub async fn upsert_record(&self, project_id: &str, record: &Observation) -> Result<PutResponse> {
        let store = self.registry.data_db(project_id).await?;
        self.write_encoded(store.as_ref(), &record.encode()).await
    }

    pub async fn lookup_record(&self, project_id: &str, record_id: &str) -> Result<Observation> {
        let store = self.registry.data_db(project_id).await?;
        let encoded = read_encoded(store.as_ref(), record_id).await?;
        if encoded.deleted {
            return Err(SyncError::NotFound(format!("record {record_id} has been deleted")));
        }
        Ok(encoded.decode())
    }

    /// All live, non-deleted records of the project.
    pub async fn list_records(&self, project_id: &str) -> Result<BTreeMap<RecordId, Observation>> {
        let store = self.registry.data_db(project_id).await?;
        let mut records = BTreeMap::new();
        for doc in store.all_docs().await? {
            if doc.body.get("format_version").and_then(|v| v.as_u64()) != Some(OBSERVATION_FORMAT_VERSION as u64) {
                continue;
            }
            match doc.deserialize_into::<EncodedObservation>() {
                Ok(encoded) if !encoded.deleted => {
                    records.insert(encoded.id.clone(), encoded.decode());
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed record {} in {project_id}: {e}", doc.id),
            }
        }
        Ok(records)
    }

    /// Every revision of every record, through the `list_all_data_rev` view.
    pub async fn list_revisions(&self, project_id: &str) -> Result<RevisionListing> {
        let store = self.registry.data_db(project_id).await?;
        ensure_revisions_view(store.as_ref()).await?;

        let mut listing = RevisionListing::new();
        for row in store.query_view(REVISIONS_VIEW_NAME).await? {
            let Some(rev) = row.value.as_str() else {
                warn!("Ignoring non-string revision for {} in {project_id}", row.id);
                continue;
            };
            let revs = listing.entry(row.id).or_default();
            if !revs.iter().any(|seen| seen == rev) {
                revs.push(rev.to_string());
            }
        }
        Ok(listing)
    }

    /// Soft-deletes a record; it stays in the store flagged as deleted.
    pub async fn delete_record(&self, project_id: &str, record_id: &str) -> Result<PutResponse> {
        self.set_deleted(project_id, record_id, true).await
    }

    pub async fn undelete_record(&self, project_id: &str, record_id: &str) -> Result<PutResponse> {
        self.set_deleted(project_id, record_id, false).await
    }

    async fn set_deleted(&self, project_id: &str, record_id: &str, deleted: bool) -> Result<PutResponse> {
        let store = self.registry.data_db(project_id).await?;
        let mut encoded = read_encoded(store.as_ref(), record_id).await?;
        encoded.deleted = deleted;
        self.write_encoded(store.as_ref(), &encoded).await
    }

    async fn write_encoded(&self, store: &dyn DocumentStore, encoded: &EncodedObservation) -> Result<PutResponse> {
        let doc = LocalDoc::from_serializable(encoded)?;
        store
            .put(doc)
            .await
            .map_err(|e| SyncError::save_failed(encoded.id.clone(), e))
    }
}

async fn read_encoded(store: &dyn DocumentStore, record_id: &str) -> Result<EncodedObservation> {
    let doc = store.get(record_id).await.map_err(|e| match e {
        SyncError::NotFound(_) => SyncError::NotFound(format!("record {record_id} not found in {}", store.name())),
        other => other,
    })?;
    doc.deserialize_into()
        .map_err(|e| SyncError::Corrupted(format!("record {record_id} is malformed: {e}")))
}

/// Creates the revisions view unless it already exists.
pub async fn ensure_revisions_view(store: &dyn DocumentStore) -> Result<()> {
    let view = ViewDefinition::new(REVISIONS_VIEW_NAME, ViewEmit::IdToRevisions);
    match store.put_view(&view).await {
        Ok(_) => {
            debug!("Created view {REVISIONS_VIEW_NAME} in {}", store.name());
            Ok(())
        }
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}
