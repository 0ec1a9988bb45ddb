//! Staging area for in-progress form edits.
//!
//! Staged values are keyed deterministically by the active project, the view
//! being edited and, when editing an existing record, that record's id and
//! revision. Reopening the same edit therefore resumes the same staged
//! values. The staging store is local to the device.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::datamodel::{RecordId, RevisionId};
use crate::doc_store::DocumentStore;
use crate::local_doc::LocalDoc;
use crate::sync_error::{Result, SyncError};

pub const STAGING_DB_NAME: &str = "staging";

/// Field name to tentative value.
pub type StagedData = Map<String, JsonValue>;

/// The record an edit started from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExistingRef {
    pub record_id: RecordId,
    pub revision_id: RevisionId,
}

impl ExistingRef {
    pub fn new(record_id: impl Into<RecordId>, revision_id: impl Into<RevisionId>) -> Self {
        Self {
            record_id: record_id.into(),
            revision_id: revision_id.into(),
        }
    }
}

/// Staged values together with the revision they were read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    pub data: StagedData,
    pub revision: RevisionId,
}

#[derive(Debug, Serialize, Deserialize)]
struct StagingDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
    fields: StagedData,
    updated: String,
}

/// Percent-encodes each component and joins them with `/`.
pub fn staging_key(active_id: &str, view_name: &str, existing: Option<&ExistingRef>) -> String {
    let mut parts = vec![urlencoding::encode(active_id), urlencoding::encode(view_name)];
    if let Some(existing) = existing {
        parts.push(urlencoding::encode(&existing.record_id));
        parts.push(urlencoding::encode(&existing.revision_id));
    }
    parts.join("/")
}

#[derive(Clone)]
pub struct StagingStore {
    store: Arc<dyn DocumentStore>,
}

impl StagingStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Staged values for the key, or `None` when nothing was staged yet.
    pub async fn get_staged(
        &self,
        active_id: &str,
        view_name: &str,
        existing: Option<&ExistingRef>,
    ) -> Result<Option<Staged>> {
        let key = staging_key(active_id, view_name, existing);
        let doc = match self.store.get(&key).await {
            Ok(doc) => doc,
            Err(SyncError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let staged: StagingDoc = doc
            .deserialize_into()
            .map_err(|e| SyncError::Corrupted(format!("staging document {key} is malformed: {e}")))?;
        Ok(Some(Staged {
            data: staged.fields,
            revision: staged.rev.unwrap_or_default(),
        }))
    }

    /// Writes staged values and returns the new revision.
    ///
    /// `known_revision` is the caller's cached revision. If it turns out to be
    /// stale the current revision is read back and the write is retried once.
    pub async fn set_staged(
        &self,
        new_data: StagedData,
        known_revision: Option<&str>,
        active_id: &str,
        view_name: &str,
        existing: Option<&ExistingRef>,
    ) -> Result<RevisionId> {
        let key = staging_key(active_id, view_name, existing);
        let doc = staging_doc(&key, new_data, known_revision.map(str::to_string))?;

        match self.store.put(doc.clone()).await {
            Ok(response) => Ok(response.rev),
            Err(e) if e.is_conflict() => {
                debug!("Staging write for {key} conflicted, retrying with current revision");
                let current = self.store.get_any(&key).await?.and_then(|current| current.rev);
                let mut retry = doc;
                retry.rev = current;
                Ok(self.store.put(retry).await?.rev)
            }
            Err(e) => Err(e),
        }
    }

    /// Empties the staged values for a key once its record is submitted.
    pub async fn clear_staged(
        &self,
        known_revision: Option<&str>,
        active_id: &str,
        view_name: &str,
        existing: Option<&ExistingRef>,
    ) -> Result<RevisionId> {
        self.set_staged(StagedData::new(), known_revision, active_id, view_name, existing)
            .await
    }

    /// Removes the staging document entirely.
    pub async fn delete_staged(&self, active_id: &str, view_name: &str, existing: Option<&ExistingRef>) -> Result<()> {
        let key = staging_key(active_id, view_name, existing);
        let doc = match self.store.get(&key).await {
            Ok(doc) => doc,
            Err(SyncError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let rev = doc.rev.unwrap_or_default();
        self.store.remove(&key, &rev).await?;
        info!("Deleted staged data {key}");
        Ok(())
    }

    /// Every non-empty staging document of an active project, by key.
    pub async fn list_staged(&self, active_id: &str) -> Result<Vec<(String, StagedData)>> {
        let prefix = format!("{}/", urlencoding::encode(active_id));
        let mut staged = Vec::new();
        for doc in self.store.all_docs().await? {
            if !doc.id.starts_with(&prefix) {
                continue;
            }
            let entry: StagingDoc = doc
                .deserialize_into()
                .map_err(|e| SyncError::Corrupted(format!("staging document {} is malformed: {e}", doc.id)))?;
            if !entry.fields.is_empty() {
                staged.push((entry.id, entry.fields));
            }
        }
        Ok(staged)
    }
}

fn staging_doc(key: &str, fields: StagedData, rev: Option<String>) -> Result<LocalDoc> {
    let mut doc = LocalDoc::from_serializable(&StagingDoc {
        id: key.to_string(),
        rev: None,
        fields,
        updated: Utc::now().to_rfc3339(),
    })?;
    doc.rev = rev;
    Ok(doc)
}
