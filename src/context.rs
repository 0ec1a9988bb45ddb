//! Wires the components together from a [`SyncConfig`].

use std::sync::Arc;

use log::{info, warn};

use crate::active::{ActiveProjectTracker, ACTIVE_DB_NAME};
use crate::config::SyncConfig;
use crate::directory::{DirectoryResolver, DIRECTORY_DB_NAME};
use crate::doc_store::StoreOpener;
use crate::lmdb_store::LmdbOpener;
use crate::records::RecordStorage;
use crate::registry::{DatabaseRegistry, RegistryOptions};
use crate::remote::{CouchConnector, RemoteConnector};
use crate::staging::{StagingStore, STAGING_DB_NAME};
use crate::staging_session::{StagingSession, StagingTarget};
use crate::sync_error::Result;

pub struct SyncContext {
    config: SyncConfig,
    directory: Arc<DirectoryResolver>,
    active: Arc<ActiveProjectTracker>,
    registry: Arc<DatabaseRegistry>,
    records: RecordStorage,
    staging: StagingStore,
}

impl SyncContext {
    /// LMDB stores under `config.data_dir`, CouchDB remotes over HTTP.
    pub async fn open(config: SyncConfig) -> Result<Self> {
        let opener = Arc::new(LmdbOpener::new(config.data_dir.clone(), config.map_size_bytes()));
        let connector = Arc::new(CouchConnector::new(config.replication_timeout())?);
        Self::open_with(config, opener, connector).await
    }

    pub async fn open_with(
        config: SyncConfig,
        opener: Arc<dyn StoreOpener>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Self> {
        let directory_store = opener.open(DIRECTORY_DB_NAME).await?;
        let mut directory = DirectoryResolver::new(directory_store, config.directory.clone());
        if config.replication.enabled {
            directory = directory.with_remote(Arc::clone(&connector), config.replication_timeout());
        }
        let directory = Arc::new(directory);

        let active = Arc::new(ActiveProjectTracker::new(opener.open(ACTIVE_DB_NAME).await?));
        let staging = StagingStore::new(opener.open(STAGING_DB_NAME).await?);

        let registry = Arc::new(DatabaseRegistry::new(
            opener,
            connector,
            Arc::clone(&directory),
            Arc::clone(&active),
            RegistryOptions {
                replication_enabled: config.replication.enabled,
                replication_timeout: config.replication_timeout(),
            },
        ));
        let records = RecordStorage::new(Arc::clone(&registry));

        info!(
            "Sync context ready, directory at {} (replication {})",
            config.directory.url(),
            if config.replication.enabled { "on" } else { "off" }
        );
        Ok(Self {
            config,
            directory,
            active,
            registry,
            records,
            staging,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<DirectoryResolver> {
        &self.directory
    }

    pub fn active(&self) -> &Arc<ActiveProjectTracker> {
        &self.active
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.registry
    }

    pub fn records(&self) -> &RecordStorage {
        &self.records
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    /// A staging session using the configured save interval and threshold.
    pub async fn staging_session(&self, target: StagingTarget) -> Result<StagingSession> {
        StagingSession::load(
            self.staging.clone(),
            target,
            self.config.save_interval(),
            self.config.staging.max_consecutive_errors,
        )
        .await
    }

    /// Destroys every local store this context knows about, enrollments and
    /// staged edits included.
    pub async fn wipe_all(&self) -> Result<()> {
        self.registry.wipe_all().await?;
        for store in [self.active.store(), self.staging.store()] {
            if let Err(e) = store.destroy().await {
                warn!("Failed to wipe {}: {e}", store.name());
            }
        }
        self.directory.wipe().await?;
        info!("Wiped all local data");
        Ok(())
    }
}
