//! Revision-tagged document envelope used by every store.
//!
//! A [`LocalDoc`] is what a document store persists: the reserved `_id`,
//! `_rev`, `_deleted` and `_revisions` members plus an arbitrary JSON body.
//! The reserved members use the same names and shapes as CouchDB so that a
//! document can travel to and from a remote database without translation.
//!
//! The write rules for optimistic concurrency ([`prepare_write`]) and for
//! accepting replicated revisions ([`merge_replicated`]) live here so that
//! every backend enforces exactly the same semantics.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::sync_error::{Result, SyncError};

/// Upper bound on how many ancestors a revision path keeps.
pub const REVS_LIMIT: usize = 1000;

/// Prefix of design documents, which hold view definitions.
pub const DESIGN_PREFIX: &str = "_design/";

fn is_false(value: &bool) -> bool {
    !*value
}

/// Revision ancestry in CouchDB's `_revisions` shape: `start` is the
/// generation of the newest revision and `ids` are the hash parts, newest
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPath {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionPath {
    /// Builds a single-entry path from a full `N-hash` token.
    pub fn from_rev(rev: &str) -> Option<Self> {
        let (generation, hash) = split_revision(rev)?;
        Some(Self {
            start: generation,
            ids: vec![hash.to_string()],
        })
    }

    /// Full revision tokens, newest first.
    pub fn full_revs(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(depth, hash)| {
                let generation = self.start.checked_sub(depth as u64)?;
                Some(format!("{generation}-{hash}"))
            })
            .collect()
    }

    pub fn contains(&self, rev: &str) -> bool {
        match split_revision(rev) {
            Some((generation, hash)) => {
                if generation > self.start {
                    return false;
                }
                let depth = (self.start - generation) as usize;
                self.ids.get(depth).map(|id| id == hash).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Prepends a child revision of the current head.
    fn push_child(&mut self, rev: &str) {
        if let Some((generation, hash)) = split_revision(rev) {
            self.start = generation;
            self.ids.insert(0, hash.to_string());
            self.ids.truncate(REVS_LIMIT);
        }
    }
}

/// Splits `N-hash` into its generation and hash.
pub fn split_revision(rev: &str) -> Option<(u64, &str)> {
    let (generation, hash) = rev.split_once('-')?;
    let generation = generation.parse::<u64>().ok()?;
    if hash.is_empty() {
        return None;
    }
    Some((generation, hash))
}

pub fn revision_generation(rev: &str) -> u64 {
    split_revision(rev).map(|(generation, _)| generation).unwrap_or(0)
}

/// Derives the revision that follows `previous` for a given body.
pub fn next_revision(previous: Option<&str>, body: &Map<String, JsonValue>, deleted: bool) -> String {
    let generation = previous.map(revision_generation).unwrap_or(0) + 1;

    let mut hasher = Sha256::new();
    hasher.update(previous.unwrap_or("").as_bytes());
    hasher.update([deleted as u8]);
    // serde_json::Map is ordered, so the encoding is stable.
    hasher.update(JsonValue::Object(body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{generation}-{}", &digest[..32])
}

/// A stored document: reserved members plus a free-form JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionPath>,

    #[serde(flatten)]
    pub body: Map<String, JsonValue>,
}

impl LocalDoc {
    pub fn new(id: impl Into<String>, body: Map<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            revisions: None,
            body,
        }
    }

    /// Parses any JSON object carrying an `_id` member.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        if !value.is_object() {
            return Err(SyncError::BadRequest("documents must be JSON objects".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes a typed document; it must produce an object with `_id`.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(value)?)
    }

    pub fn to_value(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reads the document back as a typed value.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value()?)?)
    }

    pub fn is_design(&self) -> bool {
        self.id.starts_with(DESIGN_PREFIX)
    }

    /// Every known revision of this document, newest first.
    pub fn revision_history(&self) -> Vec<String> {
        match (&self.revisions, &self.rev) {
            (Some(path), _) => path.full_revs(),
            (None, Some(rev)) => vec![rev.clone()],
            (None, None) => Vec::new(),
        }
    }

    fn knows_revision(&self, rev: &str) -> bool {
        match &self.revisions {
            Some(path) => path.contains(rev),
            None => self.rev.as_deref() == Some(rev),
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Applies the optimistic-concurrency rules for a local write and returns the
/// document as it must be stored, with its new revision assigned.
///
/// * absent document: `_rev` must be absent
/// * tombstone: `_rev` must be absent or match the tombstone
/// * live document: `_rev` must match the current revision
pub fn prepare_write(current: Option<&LocalDoc>, mut doc: LocalDoc) -> Result<LocalDoc> {
    let parent = match current {
        None => {
            if let Some(rev) = &doc.rev {
                return Err(SyncError::Conflict(format!(
                    "document {} does not exist but revision {rev} was supplied",
                    doc.id
                )));
            }
            None
        }
        Some(existing) if existing.deleted => {
            if doc.rev.is_some() && doc.rev != existing.rev {
                return Err(SyncError::Conflict(format!(
                    "stale revision for deleted document {}",
                    doc.id
                )));
            }
            Some(existing)
        }
        Some(existing) => {
            if doc.rev != existing.rev {
                return Err(SyncError::Conflict(format!(
                    "document {} is at revision {}, write supplied {}",
                    doc.id,
                    existing.rev.as_deref().unwrap_or("none"),
                    doc.rev.as_deref().unwrap_or("none"),
                )));
            }
            Some(existing)
        }
    };

    let parent_rev = parent.and_then(|p| p.rev.clone());
    let new_rev = next_revision(parent_rev.as_deref(), &doc.body, doc.deleted);

    let mut path = parent
        .and_then(|p| p.revisions.clone().or_else(|| p.rev.as_deref().and_then(RevisionPath::from_rev)))
        .unwrap_or(RevisionPath {
            start: 0,
            ids: Vec::new(),
        });
    path.push_child(&new_rev);

    doc.rev = Some(new_rev);
    doc.revisions = Some(path);
    Ok(doc)
}

/// Decides whether a revision arriving from replication replaces the local
/// one. Returns the document to store, or `None` when the local copy wins.
///
/// The incoming revision wins if it descends from the local revision, or if
/// the two are unrelated and the incoming one is deterministically larger
/// (higher generation, then larger token), which is the order CouchDB uses
/// to pick a winning revision.
pub fn merge_replicated(current: Option<&LocalDoc>, mut incoming: LocalDoc) -> Result<Option<LocalDoc>> {
    let incoming_rev = match incoming.rev.clone() {
        Some(rev) if split_revision(&rev).is_some() => rev,
        Some(rev) => {
            return Err(SyncError::BadRequest(format!(
                "replicated document {} has malformed revision {rev}",
                incoming.id
            )))
        }
        None => {
            return Err(SyncError::BadRequest(format!(
                "replicated document {} carries no revision",
                incoming.id
            )))
        }
    };

    if incoming.revisions.is_none() {
        incoming.revisions = RevisionPath::from_rev(&incoming_rev);
    }

    let Some(local) = current else {
        return Ok(Some(incoming));
    };
    let Some(local_rev) = local.rev.as_deref() else {
        return Ok(Some(incoming));
    };

    if local_rev == incoming_rev || local.knows_revision(&incoming_rev) {
        return Ok(None);
    }
    if incoming.knows_revision(local_rev) {
        return Ok(Some(incoming));
    }

    let local_key = (revision_generation(local_rev), local_rev);
    let incoming_key = (revision_generation(&incoming_rev), incoming_rev.as_str());
    if incoming_key > local_key {
        Ok(Some(incoming))
    } else {
        Ok(None)
    }
}
