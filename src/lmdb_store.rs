//! LMDB-backed document store.
//!
//! Each named database gets its own LMDB environment, a directory named
//! `<url-encoded name>.lmdb` under the configured data directory. Documents
//! are stored as JSON under their `_id`. Every write reads the current
//! document and writes the new revision inside one write transaction, so the
//! revision check and the write cannot interleave with another writer.
//! Writes and scans run on tokio's blocking pool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, Error as LmdbError, RwTransaction, Transaction, WriteFlags};
use log::{debug, info, warn};

use crate::doc_store::{not_found, DocumentStore, PutResponse, StoreOpener};
use crate::local_doc::{merge_replicated, prepare_write, LocalDoc};
use crate::sync_error::{Result, SyncError};

const DOCS_DB_NAME: &str = "docs";

/// The open environment and its document table. Shared with blocking tasks.
struct LmdbEnv {
    name: String,
    env: Environment,
    db: Database,
}

impl LmdbEnv {
    fn read(&self, id: &str) -> Result<Option<LocalDoc>> {
        let txn = self.env.begin_ro_txn()?;
        let result = match txn.get(self.db, &id) {
            Ok(bytes) => Some(LocalDoc::from_bytes(bytes)?),
            Err(LmdbError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        txn.abort();
        Ok(result)
    }

    fn read_in(txn: &RwTransaction<'_>, db: Database, id: &str) -> Result<Option<LocalDoc>> {
        match txn.get(db, &id) {
            Ok(bytes) => Ok(Some(LocalDoc::from_bytes(bytes)?)),
            Err(LmdbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, doc: LocalDoc) -> Result<PutResponse> {
        let mut txn = self.env.begin_rw_txn()?;
        let current = Self::read_in(&txn, self.db, &doc.id)?;
        // Dropping txn on the error path aborts it.
        let stored = prepare_write(current.as_ref(), doc)?;
        txn.put(self.db, &stored.id, &stored.to_bytes()?, WriteFlags::empty())?;
        txn.commit()?;

        Ok(PutResponse {
            id: stored.id,
            rev: stored.rev.unwrap_or_default(),
        })
    }

    fn write_replicated(&self, doc: LocalDoc) -> Result<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let current = Self::read_in(&txn, self.db, &doc.id)?;
        match merge_replicated(current.as_ref(), doc)? {
            Some(winner) => {
                txn.put(self.db, &winner.id, &winner.to_bytes()?, WriteFlags::empty())?;
                txn.commit()?;
                Ok(true)
            }
            None => {
                txn.abort();
                Ok(false)
            }
        }
    }

    fn scan(&self) -> Result<Vec<LocalDoc>> {
        let txn = self.env.begin_ro_txn()?;
        let mut docs = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.db)?;
            for (_key, value) in cursor.iter() {
                match LocalDoc::from_bytes(value) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => warn!("Skipping undecodable entry in {}: {e}", self.name),
                }
            }
        }
        txn.abort();
        Ok(docs)
    }

    fn clear(&self) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.db)?;
        txn.commit()?;
        self.env.sync(true)?;
        Ok(())
    }
}

pub struct LmdbStore {
    name: String,
    path: PathBuf,
    env: Arc<LmdbEnv>,
}

impl LmdbStore {
    /// Opens or creates the environment for `name` under `dir`.
    pub fn open(dir: &Path, name: &str, map_size: usize) -> Result<Self> {
        if name.is_empty() {
            return Err(SyncError::BadRequest("database name cannot be empty".to_string()));
        }

        let path = dir.join(format!("{}.lmdb", urlencoding::encode(name)));
        if path.exists() {
            debug!("Reopening LMDB environment at {}", path.display());
        } else {
            info!("Creating LMDB environment at {}", path.display());
        }
        fs::create_dir_all(&path)?;

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size)
            .open(&path)?;
        let db = env.create_db(Some(DOCS_DB_NAME), DatabaseFlags::empty())?;

        Ok(Self {
            name: name.to_string(),
            path,
            env: Arc::new(LmdbEnv {
                name: name.to_string(),
                env,
                db,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs a transaction on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LmdbEnv) -> Result<T> + Send + 'static,
    {
        let env = Arc::clone(&self.env);
        tokio::task::spawn_blocking(move || op(&env))
            .await
            .map_err(|e| SyncError::DatabaseError(format!("LMDB task for {} failed: {e}", self.name)))?
    }
}

#[async_trait]
impl DocumentStore for LmdbStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<LocalDoc> {
        match self.env.read(id)? {
            Some(doc) if !doc.deleted => Ok(doc),
            _ => Err(not_found(&self.name, id)),
        }
    }

    async fn get_any(&self, id: &str) -> Result<Option<LocalDoc>> {
        self.env.read(id)
    }

    async fn put(&self, doc: LocalDoc) -> Result<PutResponse> {
        if doc.id.is_empty() {
            return Err(SyncError::BadRequest("document _id cannot be empty".to_string()));
        }
        self.blocking(move |env| env.write(doc)).await
    }

    async fn put_replicated(&self, doc: LocalDoc) -> Result<bool> {
        if doc.id.is_empty() {
            return Err(SyncError::BadRequest("document _id cannot be empty".to_string()));
        }
        self.blocking(move |env| env.write_replicated(doc)).await
    }

    async fn all_docs(&self) -> Result<Vec<LocalDoc>> {
        Ok(self
            .blocking(LmdbEnv::scan)
            .await?
            .into_iter()
            .filter(|doc| !doc.deleted && !doc.is_design())
            .collect())
    }

    async fn changes(&self) -> Result<Vec<LocalDoc>> {
        self.blocking(LmdbEnv::scan).await
    }

    /// Empties the environment in place. The directory stays, so handles
    /// still held elsewhere keep writing to the files a restart will read.
    async fn destroy(&self) -> Result<()> {
        self.blocking(LmdbEnv::clear).await?;
        info!("Cleared LMDB environment at {}", self.path.display());
        Ok(())
    }
}

/// Opens one [`LmdbStore`] per database name under a shared directory.
///
/// LMDB must not open the same environment twice in one process, so live
/// stores are remembered and handed out again.
pub struct LmdbOpener {
    dir: PathBuf,
    map_size: usize,
    open_stores: Mutex<HashMap<String, Weak<LmdbStore>>>,
}

impl LmdbOpener {
    pub fn new(dir: impl Into<PathBuf>, map_size: usize) -> Self {
        Self {
            dir: dir.into(),
            map_size,
            open_stores: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StoreOpener for LmdbOpener {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        let mut open_stores = self
            .open_stores
            .lock()
            .map_err(|_| SyncError::DatabaseError("LMDB opener lock poisoned".to_string()))?;

        if let Some(store) = open_stores.get(name).and_then(Weak::upgrade) {
            return Ok(store);
        }

        let store = Arc::new(LmdbStore::open(&self.dir, name, self.map_size)?);
        open_stores.insert(name.to_string(), Arc::downgrade(&store));
        Ok(store)
    }
}
