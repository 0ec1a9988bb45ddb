//! Error taxonomy shared by every layer of the crate.
//!
//! Store failures, replication failures and data-model violations all end up
//! as a [`SyncError`]. Callers decide what is fatal: the registry swallows
//! [`SyncError::SyncUnavailable`], the staging store retries
//! [`SyncError::Conflict`] once, everything else propagates.

use lmdb::Error as LmdbError;
use serde_json::Error as SerdeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Document update conflict: {0}")]
    Conflict(String),

    #[error("Corrupted document: {0}")]
    Corrupted(String),

    #[error("Sync unavailable: {0}")]
    SyncUnavailable(String),

    #[error("Failed to save {id}: {source}")]
    SaveFailed {
        id: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SyncError {
    /// Wraps a store error raised while writing document `id`.
    pub fn save_failed(id: impl Into<String>, source: SyncError) -> Self {
        SyncError::SaveFailed {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// True for a revision mismatch, including one wrapped in `SaveFailed`.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Conflict(_) => true,
            SyncError::SaveFailed { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<LmdbError> for SyncError {
    fn from(err: LmdbError) -> Self {
        match err {
            LmdbError::NotFound => SyncError::NotFound("key not found in LMDB".to_string()),
            LmdbError::MapFull => {
                SyncError::DatabaseError("LMDB map is full, increase storage.map_size_mb".to_string())
            }
            LmdbError::Corrupted => SyncError::DatabaseError("LMDB environment is corrupted".to_string()),
            other => SyncError::DatabaseError(format!("LMDB error: {other}")),
        }
    }
}

impl From<SerdeError> for SyncError {
    fn from(err: SerdeError) -> Self {
        SyncError::SerializationError(format!("JSON serialization error: {err}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::SyncUnavailable(format!("remote request timed out: {err}"))
        } else {
            SyncError::SyncUnavailable(format!("remote request failed: {err}"))
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigError(format!("invalid TOML: {err}"))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::DatabaseError(format!("IO error: {err}"))
    }
}
