//! Resolves listings (tenants) to the connection parameters of their
//! projects and people databases.
//!
//! Listings are read from the local `directory` store. When a listing is not
//! there yet, the resolver pulls the remote directory once and reads again;
//! that is the only place where a network failure reaches the caller, since
//! nothing local can stand in for a listing that was never fetched.
//!
//! The default listing is cached for the lifetime of the resolver. The cache
//! is only replaced by [`DirectoryResolver::refresh`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::connection::{materialize, ConnectionInfo};
use crate::datamodel::{Listing, NonNullListing};
use crate::doc_store::DocumentStore;
use crate::remote::RemoteConnector;
use crate::replication::{replicate_once, ReplicationDirection, ReplicationReport};
use crate::sync_error::{Result, SyncError};

pub const DEFAULT_LISTING_ID: &str = "default";
pub const DIRECTORY_DB_NAME: &str = "directory";

struct DirectoryRemote {
    connector: Arc<dyn RemoteConnector>,
    timeout: Duration,
}

pub struct DirectoryResolver {
    store: Arc<dyn DocumentStore>,
    directory_info: ConnectionInfo,
    remote: Option<DirectoryRemote>,
    default_listing: Mutex<Option<Arc<NonNullListing>>>,
}

impl DirectoryResolver {
    /// A resolver that only ever reads the local directory store.
    pub fn new(store: Arc<dyn DocumentStore>, directory_info: ConnectionInfo) -> Self {
        Self {
            store,
            directory_info,
            remote: None,
            default_listing: Mutex::new(None),
        }
    }

    /// Allows pulling the remote directory when a listing is missing locally.
    pub fn with_remote(mut self, connector: Arc<dyn RemoteConnector>, timeout: Duration) -> Self {
        self.remote = Some(DirectoryRemote { connector, timeout });
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn directory_info(&self) -> &ConnectionInfo {
        &self.directory_info
    }

    /// The default listing, fetched on first use and cached afterwards.
    pub async fn resolve_default_listing(&self) -> Result<Arc<NonNullListing>> {
        // Held across the fetch so concurrent first calls share one lookup.
        let mut cached = self.default_listing.lock().await;
        if let Some(listing) = cached.as_ref() {
            return Ok(Arc::clone(listing));
        }

        let listing = Arc::new(self.fetch(DEFAULT_LISTING_ID).await?);
        info!("Resolved default listing {} ({})", listing.id, listing.name);
        *cached = Some(Arc::clone(&listing));
        Ok(listing)
    }

    /// Any listing by id. Only the default listing is cached.
    pub async fn resolve_listing(&self, listing_id: &str) -> Result<Arc<NonNullListing>> {
        if listing_id == DEFAULT_LISTING_ID {
            return self.resolve_default_listing().await;
        }
        Ok(Arc::new(self.fetch(listing_id).await?))
    }

    pub async fn cached(&self) -> Option<Arc<NonNullListing>> {
        self.default_listing.lock().await.clone()
    }

    /// Drops the cached default listing and the local directory contents.
    pub async fn wipe(&self) -> Result<()> {
        let mut cached = self.default_listing.lock().await;
        *cached = None;
        self.store.destroy().await
    }

    /// Re-pulls the directory and re-reads the default listing. On failure the
    /// previously cached listing stays in place.
    pub async fn refresh(&self) -> Result<Arc<NonNullListing>> {
        let mut cached = self.default_listing.lock().await;

        if self.remote.is_some() {
            if let Err(e) = self.pull_directory().await {
                warn!("Directory refresh could not reach the remote, using local copy: {e}");
            }
        }

        let listing = Arc::new(self.fetch(DEFAULT_LISTING_ID).await?);
        *cached = Some(Arc::clone(&listing));
        Ok(listing)
    }

    async fn fetch(&self, listing_id: &str) -> Result<NonNullListing> {
        let doc = match self.store.get(listing_id).await {
            Ok(doc) => doc,
            Err(SyncError::NotFound(_)) => {
                debug!("Listing {listing_id} not in local directory, pulling");
                if let Err(e) = self.pull_directory().await {
                    return Err(SyncError::NotFound(format!(
                        "listing {listing_id} is not in the local directory and the remote directory is unavailable: {e}"
                    )));
                }
                self.store.get(listing_id).await.map_err(|e| match e {
                    SyncError::NotFound(_) => SyncError::NotFound(format!("listing {listing_id} is not in the directory")),
                    other => other,
                })?
            }
            Err(e) => return Err(e),
        };

        let listing: Listing = doc
            .deserialize_into()
            .map_err(|e| SyncError::Corrupted(format!("directory entry {listing_id} is malformed: {e}")))?;
        self.complete(listing)
    }

    fn complete(&self, listing: Listing) -> Result<NonNullListing> {
        let projects_db = materialize(&self.directory_info, listing.projects_db.as_ref()).ok_or_else(|| {
            SyncError::Corrupted(format!("listing {} has no projects_db connection info", listing.id))
        })?;
        let people_db = materialize(&self.directory_info, listing.people_db.as_ref()).ok_or_else(|| {
            SyncError::Corrupted(format!("listing {} has no people_db connection info", listing.id))
        })?;

        Ok(NonNullListing {
            id: listing.id,
            name: listing.name,
            description: listing.description,
            projects_db,
            people_db,
        })
    }

    async fn pull_directory(&self) -> Result<ReplicationReport> {
        let Some(remote) = &self.remote else {
            return Err(SyncError::SyncUnavailable("no remote directory configured".to_string()));
        };
        let db = remote.connector.connect(&self.directory_info).await?;
        replicate_once(db.as_ref(), self.store.as_ref(), ReplicationDirection::Pull, remote.timeout).await
    }
}
