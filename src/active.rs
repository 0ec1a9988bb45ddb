//! Which projects this device is enrolled in.
//!
//! The `active` store holds credentials and is never replicated. Listing
//! enrollments is best effort: a malformed entry is deleted and skipped so
//! the remaining projects can still be brought up.

use std::sync::Arc;

use log::{info, warn};

use crate::datamodel::{resolve_project_id, ActiveDoc};
use crate::doc_store::DocumentStore;
use crate::local_doc::LocalDoc;
use crate::sync_error::{Result, SyncError};

pub const ACTIVE_DB_NAME: &str = "active";

pub struct ActiveProjectTracker {
    store: Arc<dyn DocumentStore>,
}

impl ActiveProjectTracker {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Enrolls the device, or updates the credentials of an existing enrollment.
    pub async fn add_active_project(
        &self,
        listing_id: &str,
        project_id: &str,
        username: &str,
        password: &str,
    ) -> Result<ActiveDoc> {
        let active = ActiveDoc {
            id: resolve_project_id(listing_id, project_id),
            listing_id: listing_id.to_string(),
            project_id: project_id.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };

        let mut doc = LocalDoc::from_serializable(&active)?;
        if let Some(existing) = self.store.get_any(&active.id).await? {
            if !existing.deleted {
                doc.rev = existing.rev;
            }
        }

        self.store
            .put(doc)
            .await
            .map_err(|e| SyncError::save_failed(active.id.clone(), e))?;
        info!("Activated project {}", active.id);
        Ok(active)
    }

    /// Every well-formed enrollment. Malformed ones are removed from the store.
    pub async fn list_active_projects(&self) -> Result<Vec<ActiveDoc>> {
        let mut active = Vec::new();
        for doc in self.store.all_docs().await? {
            match doc.deserialize_into::<ActiveDoc>() {
                Ok(entry) => active.push(entry),
                Err(e) => {
                    warn!("Removing corrupted enrollment {}: {e}", doc.id);
                    self.discard(&doc).await;
                }
            }
        }
        Ok(active)
    }

    pub async fn get_active_project(&self, active_id: &str) -> Result<ActiveDoc> {
        let doc = self.store.get(active_id).await.map_err(|e| match e {
            SyncError::NotFound(_) => SyncError::NotFound(format!("project {active_id} is not active on this device")),
            other => other,
        })?;
        doc.deserialize_into()
            .map_err(|e| SyncError::Corrupted(format!("enrollment {active_id} is malformed: {e}")))
    }

    /// Leaves a project on this device.
    pub async fn remove_active_project(&self, active_id: &str) -> Result<()> {
        let doc = self.store.get(active_id).await?;
        let rev = doc
            .rev
            .ok_or_else(|| SyncError::Corrupted(format!("enrollment {active_id} has no revision")))?;
        self.store.remove(active_id, &rev).await?;
        info!("Deactivated project {active_id}");
        Ok(())
    }

    async fn discard(&self, doc: &LocalDoc) {
        let Some(rev) = doc.rev.as_deref() else {
            warn!("Corrupted enrollment {} has no revision, leaving it", doc.id);
            return;
        };
        if let Err(e) = self.store.remove(&doc.id, rev).await {
            warn!("Could not remove corrupted enrollment {}: {e}", doc.id);
        }
    }
}
