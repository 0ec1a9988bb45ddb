//! Registry of opened local stores and their remote counterparts.
//!
//! A store is identified by its [`DbKind`] and a composite id (a listing id
//! for projects/people stores, an active project id for data/metadata
//! stores). The first request for a store opens it locally and runs one
//! replication pass from its remote; later requests return the same handle
//! without touching the network.
//!
//! Initialization is single-flight per store: concurrent callers share one
//! `OnceCell` and wait for the same open-and-replicate. A failed local open
//! leaves nothing registered, so the next call starts over. A failed remote
//! connection or replication is logged, the remote handle is dropped and the
//! local store is handed out anyway. While a store has no remote, each later
//! request tries to reconnect it; one attempt per store runs at a time and
//! callers arriving during it get the local handle straight away.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OnceCell};

use crate::active::ActiveProjectTracker;
use crate::connection::{materialize, ConnectionInfo};
use crate::datamodel::{resolve_project_id, split_full_project_id, ProjectObject};
use crate::directory::DirectoryResolver;
use crate::doc_store::{DocumentStore, StoreOpener};
use crate::remote::{RemoteConnector, RemoteDatabase};
use crate::replication::{replicate_once, ReplicationDirection};
use crate::sync_error::{Result, SyncError};

/// Joins a kind prefix and a composite id into a local store name.
pub const LOCAL_NAME_SEPARATOR: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbKind {
    /// A listing's catalogue of projects.
    Projects,
    /// A listing's users.
    People,
    /// A project's records.
    Data,
    /// A project's schemas and UI specifications.
    Metadata,
}

impl DbKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            DbKind::Projects => "projects",
            DbKind::People => "people",
            DbKind::Data => "data",
            DbKind::Metadata => "metadata",
        }
    }

    /// Only record data flows back to the server.
    pub fn direction(&self) -> ReplicationDirection {
        match self {
            DbKind::Data => ReplicationDirection::PushAndPull,
            _ => ReplicationDirection::Pull,
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

pub fn local_db_name(kind: DbKind, id: &str) -> String {
    format!("{}{LOCAL_NAME_SEPARATOR}{id}", kind.prefix())
}

type DbKey = (DbKind, String);
type StoreCell = Arc<OnceCell<Arc<dyn DocumentStore>>>;
type ReconnectGate = Arc<Mutex<()>>;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub replication_enabled: bool,
    pub replication_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            replication_enabled: true,
            replication_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DatabaseRegistry {
    opener: Arc<dyn StoreOpener>,
    connector: Arc<dyn RemoteConnector>,
    directory: Arc<DirectoryResolver>,
    active: Arc<ActiveProjectTracker>,
    options: RegistryOptions,
    locals: Mutex<HashMap<DbKey, StoreCell>>,
    remotes: Mutex<HashMap<DbKey, Arc<dyn RemoteDatabase>>>,
    reconnecting: Mutex<HashMap<DbKey, ReconnectGate>>,
}

impl DatabaseRegistry {
    pub fn new(
        opener: Arc<dyn StoreOpener>,
        connector: Arc<dyn RemoteConnector>,
        directory: Arc<DirectoryResolver>,
        active: Arc<ActiveProjectTracker>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            opener,
            connector,
            directory,
            active,
            options,
            locals: Mutex::new(HashMap::new()),
            remotes: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Arc<DirectoryResolver> {
        &self.directory
    }

    pub fn active(&self) -> &Arc<ActiveProjectTracker> {
        &self.active
    }

    /// The store for `(kind, id)` if it finished initializing.
    pub async fn registered(&self, kind: DbKind, id: &str) -> Option<Arc<dyn DocumentStore>> {
        let cell = self.locals.lock().await.get(&(kind, id.to_string())).cloned()?;
        cell.get().cloned()
    }

    pub async fn is_registered(&self, kind: DbKind, id: &str) -> bool {
        self.registered(kind, id).await.is_some()
    }

    /// Whether a live remote handle is paired with `(kind, id)`.
    pub async fn has_remote(&self, kind: DbKind, id: &str) -> bool {
        self.remotes.lock().await.contains_key(&(kind, id.to_string()))
    }

    /// A registered store with nothing left to do on the network: it either
    /// has a live remote or replication is off.
    async fn settled(&self, kind: DbKind, id: &str) -> Option<Arc<dyn DocumentStore>> {
        let store = self.registered(kind, id).await?;
        if self.options.replication_enabled && !self.has_remote(kind, id).await {
            return None;
        }
        Some(store)
    }

    pub async fn registered_ids(&self, kind: DbKind) -> Vec<String> {
        let locals = self.locals.lock().await;
        let mut ids: Vec<String> = locals
            .iter()
            .filter(|((k, _), cell)| *k == kind && cell.initialized())
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn ensure_projects_db(&self, listing_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.ensure_listing_db(DbKind::Projects, listing_id).await
    }

    pub async fn ensure_people_db(&self, listing_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.ensure_listing_db(DbKind::People, listing_id).await
    }

    /// The data store of a project, keyed by its active id.
    pub async fn ensure_project_db(&self, listing_id: &str, project_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.ensure_active_db(DbKind::Data, listing_id, project_id).await
    }

    pub async fn ensure_metadata_db(&self, listing_id: &str, project_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.ensure_active_db(DbKind::Metadata, listing_id, project_id).await
    }

    /// The data store for an enrolled project, materialized on demand.
    pub async fn data_db(&self, active_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.enrolled_db(DbKind::Data, active_id).await
    }

    pub async fn metadata_db(&self, active_id: &str) -> Result<Arc<dyn DocumentStore>> {
        self.enrolled_db(DbKind::Metadata, active_id).await
    }

    /// Destroys every registered store and forgets all handles.
    pub async fn wipe_all(&self) -> Result<()> {
        let cells: Vec<(DbKey, StoreCell)> = self.locals.lock().await.drain().collect();
        self.remotes.lock().await.clear();
        self.reconnecting.lock().await.clear();

        for ((kind, id), cell) in cells {
            if let Some(store) = cell.get() {
                match store.destroy().await {
                    Ok(()) => debug!("Wiped {kind} database {id}"),
                    Err(e) => warn!("Failed to wipe {kind} database {id}: {e}"),
                }
            }
        }
        info!("Wiped all registered databases");
        Ok(())
    }

    async fn ensure_listing_db(&self, kind: DbKind, listing_id: &str) -> Result<Arc<dyn DocumentStore>> {
        if let Some(store) = self.settled(kind, listing_id).await {
            return Ok(store);
        }

        let remote = match self.directory.resolve_listing(listing_id).await {
            Ok(listing) => Some(match kind {
                DbKind::People => listing.people_db.clone(),
                _ => listing.projects_db.clone(),
            }),
            Err(e) => {
                warn!("No connection info for {kind} of listing {listing_id}, staying local: {e}");
                None
            }
        };
        self.ensure_db(kind, listing_id, remote).await
    }

    async fn ensure_active_db(
        &self,
        kind: DbKind,
        listing_id: &str,
        project_id: &str,
    ) -> Result<Arc<dyn DocumentStore>> {
        let active_id = resolve_project_id(listing_id, project_id);
        if let Some(store) = self.settled(kind, &active_id).await {
            return Ok(store);
        }

        let remote = match self.project_connection(kind, listing_id, project_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("{kind} database of {active_id} stays local: {e}");
                None
            }
        };
        self.ensure_db(kind, &active_id, remote).await
    }

    async fn enrolled_db(&self, kind: DbKind, active_id: &str) -> Result<Arc<dyn DocumentStore>> {
        if let Some(store) = self.settled(kind, active_id).await {
            return Ok(store);
        }
        let (listing_id, project_id) = split_full_project_id(active_id)?;
        self.active.get_active_project(active_id).await?;
        self.ensure_active_db(kind, &listing_id, &project_id).await
    }

    /// Connection info for a project's data or metadata database, taken from
    /// its entry in the listing's projects store.
    async fn project_connection(&self, kind: DbKind, listing_id: &str, project_id: &str) -> Result<ConnectionInfo> {
        let listing = self.directory.resolve_listing(listing_id).await?;
        let projects = self.ensure_projects_db(listing_id).await?;

        let project: ProjectObject = projects
            .get(project_id)
            .await
            .map_err(|e| SyncError::SyncUnavailable(format!("project {project_id} unknown to {listing_id}: {e}")))?
            .deserialize_into()
            .map_err(|e| SyncError::Corrupted(format!("project {project_id} is malformed: {e}")))?;

        let overlay = match kind {
            DbKind::Metadata => project.metadata_db.as_ref(),
            _ => project.data_db.as_ref(),
        };
        let info = materialize(&listing.projects_db, overlay).ok_or_else(|| {
            SyncError::SyncUnavailable(format!("project {project_id} declares no {kind} database"))
        })?;

        let active_id = resolve_project_id(listing_id, project_id);
        match self.active.get_active_project(&active_id).await {
            Ok(active) => Ok(info.with_credentials(active.username, active.password)),
            Err(_) => Ok(info),
        }
    }

    async fn ensure_db(
        &self,
        kind: DbKind,
        id: &str,
        remote: Option<ConnectionInfo>,
    ) -> Result<Arc<dyn DocumentStore>> {
        let key: DbKey = (kind, id.to_string());
        let cell = {
            let mut locals = self.locals.lock().await;
            Arc::clone(locals.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())))
        };

        if let Some(store) = cell.get() {
            debug!("{kind} database {id} already registered");
            let store = Arc::clone(store);
            if let Some(info) = remote.filter(|_| self.options.replication_enabled) {
                self.reconnect(&key, &store, info).await;
            }
            return Ok(store);
        }

        match cell.get_or_try_init(|| self.initialize(&key, remote)).await {
            Ok(store) => Ok(Arc::clone(store)),
            Err(e) => {
                let mut locals = self.locals.lock().await;
                let stale = locals
                    .get(&key)
                    .map(|current| Arc::ptr_eq(current, &cell) && !current.initialized())
                    .unwrap_or(false);
                if stale {
                    locals.remove(&key);
                }
                Err(e)
            }
        }
    }

    async fn initialize(&self, key: &DbKey, remote: Option<ConnectionInfo>) -> Result<Arc<dyn DocumentStore>> {
        let name = local_db_name(key.0, &key.1);
        let local = self.opener.open(&name).await?;
        info!("Opened local database {name}");

        match remote {
            Some(info) if self.options.replication_enabled => self.attach_remote(key, &local, info).await,
            Some(_) => debug!("Replication disabled, {name} stays local"),
            None => debug!("{name} has no remote"),
        }
        Ok(local)
    }

    async fn reconnect(&self, key: &DbKey, local: &Arc<dyn DocumentStore>, info: ConnectionInfo) {
        let gate = {
            let mut gates = self.reconnecting.lock().await;
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let Ok(_attempt) = gate.try_lock() else {
            debug!("Reconnect of {} already in progress", local.name());
            return;
        };
        if self.remotes.lock().await.contains_key(key) {
            return;
        }
        info!("Retrying remote for {}", local.name());
        self.attach_remote(key, local, info).await;
    }

    async fn attach_remote(&self, key: &DbKey, local: &Arc<dyn DocumentStore>, info: ConnectionInfo) {
        let remote = match self.connector.connect(&info).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Could not connect {} to {}: {e}", local.name(), info.url());
                self.remotes.lock().await.remove(key);
                return;
            }
        };
        self.remotes.lock().await.insert(key.clone(), Arc::clone(&remote));

        let result = replicate_once(
            remote.as_ref(),
            local.as_ref(),
            key.0.direction(),
            self.options.replication_timeout,
        )
        .await;
        if let Err(e) = result {
            warn!("{} continues offline: {e}", local.name());
            self.remotes.lock().await.remove(key);
        }
    }
}
