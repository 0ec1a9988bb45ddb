//! Remote document databases.
//!
//! [`RemoteDatabase`] is the slice of a remote CouchDB-compatible database
//! that one-shot replication needs: a pull feed carrying revision paths and a
//! bulk write that keeps the revisions it is given. [`CouchRemote`] speaks
//! the CouchDB HTTP API through `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connection::ConnectionInfo;
use crate::local_doc::LocalDoc;
use crate::sync_error::{Result, SyncError};

#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    fn info(&self) -> &ConnectionInfo;

    /// Every document on the remote, tombstones included, with revision paths
    /// where the remote provides them.
    async fn fetch_all(&self) -> Result<Vec<LocalDoc>>;

    /// Writes documents keeping their revisions. Returns how many were accepted.
    async fn push(&self, docs: Vec<LocalDoc>) -> Result<usize>;
}

/// Builds remote handles from connection parameters.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteDatabase>>;
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    results: Vec<ChangeRow>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
struct BulkGetRequest<'a> {
    docs: Vec<BulkGetItem<'a>>,
}

#[derive(Debug, Serialize)]
struct BulkGetItem<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct BulkGetResponse {
    results: Vec<BulkGetResult>,
}

#[derive(Debug, Deserialize)]
struct BulkGetResult {
    id: String,
    docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Deserialize)]
struct BulkGetDoc {
    #[serde(default)]
    ok: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
struct BulkDocsRequest<'a> {
    docs: &'a [JsonValue],
    new_edits: bool,
}

pub struct CouchRemote {
    info: ConnectionInfo,
    base_url: Url,
    client: Client,
}

impl CouchRemote {
    pub fn new(client: Client, info: ConnectionInfo) -> Result<Self> {
        let base_url = info.to_url()?;
        Ok(Self {
            info,
            base_url,
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.info.jwt_token {
            request.bearer_auth(token)
        } else if let Some(auth) = &self.info.auth {
            request.basic_auth(&auth.username, Some(&auth.password))
        } else {
            request
        }
    }

    async fn fetch_live(&self, ids: &[String]) -> Result<Vec<LocalDoc>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body = BulkGetRequest {
            docs: ids.iter().map(|id| BulkGetItem { id }).collect(),
        };
        let response: BulkGetResponse = self
            .authorize(self.client.post(self.endpoint("_bulk_get?revs=true")))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut docs = Vec::new();
        for result in response.results {
            for entry in result.docs {
                match (entry.ok, entry.error) {
                    (Some(value), _) => docs.push(LocalDoc::from_value(value)?),
                    (None, Some(error)) => warn!("Remote {} could not return {}: {error}", self.info.db_name, result.id),
                    (None, None) => {}
                }
            }
        }
        Ok(docs)
    }
}

#[async_trait]
impl RemoteDatabase for CouchRemote {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn fetch_all(&self) -> Result<Vec<LocalDoc>> {
        let changes: ChangesResponse = self
            .authorize(self.client.get(self.endpoint("_changes?include_docs=true")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut docs = Vec::new();
        let mut live_ids = Vec::new();
        for row in changes.results {
            if row.deleted {
                if let Some(doc) = row.doc {
                    docs.push(LocalDoc::from_value(doc)?);
                }
            } else {
                live_ids.push(row.id);
            }
        }
        debug!(
            "Remote {} reported {} live and {} deleted documents",
            self.info.db_name,
            live_ids.len(),
            docs.len()
        );

        docs.extend(self.fetch_live(&live_ids).await?);
        Ok(docs)
    }

    async fn push(&self, docs: Vec<LocalDoc>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }

        let values = docs.iter().map(LocalDoc::to_value).collect::<Result<Vec<_>>>()?;
        let results: Vec<JsonValue> = self
            .authorize(self.client.post(self.endpoint("_bulk_docs")))
            .json(&BulkDocsRequest {
                docs: &values,
                new_edits: false,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // With new_edits=false CouchDB only reports the failures.
        let rejected = results.iter().filter(|r| r.get("error").is_some()).count();
        if rejected > 0 {
            warn!("Remote {} rejected {rejected} of {} documents", self.info.db_name, values.len());
        }
        Ok(values.len().saturating_sub(rejected))
    }
}

/// Connects to CouchDB-compatible servers over HTTP.
pub struct CouchConnector {
    client: Client,
}

impl CouchConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::ConfigError(format!("could not build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteConnector for CouchConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteDatabase>> {
        Ok(Arc::new(CouchRemote::new(self.client.clone(), info.clone())?))
    }
}
