//! Process-local document store.
//!
//! Same write rules as the LMDB backend, nothing touches disk. The opener
//! hands out the same store for the same name for as long as it lives.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::doc_store::{not_found, DocumentStore, PutResponse, StoreOpener};
use crate::local_doc::{merge_replicated, prepare_write, LocalDoc};
use crate::sync_error::{Result, SyncError};

pub struct MemoryStore {
    name: String,
    docs: Mutex<BTreeMap<String, LocalDoc>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<LocalDoc> {
        match self.docs.lock().await.get(id) {
            Some(doc) if !doc.deleted => Ok(doc.clone()),
            _ => Err(not_found(&self.name, id)),
        }
    }

    async fn get_any(&self, id: &str) -> Result<Option<LocalDoc>> {
        Ok(self.docs.lock().await.get(id).cloned())
    }

    async fn put(&self, doc: LocalDoc) -> Result<PutResponse> {
        if doc.id.is_empty() {
            return Err(SyncError::BadRequest("document _id cannot be empty".to_string()));
        }
        let mut docs = self.docs.lock().await;
        let stored = prepare_write(docs.get(&doc.id), doc)?;
        let response = PutResponse {
            id: stored.id.clone(),
            rev: stored.rev.clone().unwrap_or_default(),
        };
        docs.insert(stored.id.clone(), stored);
        Ok(response)
    }

    async fn put_replicated(&self, doc: LocalDoc) -> Result<bool> {
        if doc.id.is_empty() {
            return Err(SyncError::BadRequest("document _id cannot be empty".to_string()));
        }
        let mut docs = self.docs.lock().await;
        match merge_replicated(docs.get(&doc.id), doc)? {
            Some(winner) => {
                docs.insert(winner.id.clone(), winner);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn all_docs(&self) -> Result<Vec<LocalDoc>> {
        Ok(self
            .docs
            .lock()
            .await
            .values()
            .filter(|doc| !doc.deleted && !doc.is_design())
            .cloned()
            .collect())
    }

    async fn changes(&self) -> Result<Vec<LocalDoc>> {
        Ok(self.docs.lock().await.values().cloned().collect())
    }

    async fn destroy(&self) -> Result<()> {
        self.docs.lock().await.clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOpener {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store behind `name`, if it was ever opened.
    pub async fn store(&self, name: &str) -> Option<Arc<MemoryStore>> {
        self.stores.lock().await.get(name).cloned()
    }

    pub async fn opened_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StoreOpener for MemoryOpener {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        if name.is_empty() {
            return Err(SyncError::BadRequest("database name cannot be empty".to_string()));
        }
        let store = self
            .stores
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(name)))
            .clone();
        Ok(store)
    }
}
