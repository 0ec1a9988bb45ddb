//! Documents exchanged between the sync layer and its callers.
//!
//! Listings and projects describe where data lives, [`ActiveDoc`] records a
//! device enrollment, and [`Observation`] is the user-entered record in its
//! canonical form with [`EncodedObservation`] as its stored form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connection::{ConnectionInfo, PossibleConnectionInfo};
use crate::sync_error::SyncError;

/// Separator between listing id and project id in an active project id.
pub const PROJECT_ID_SEPARATOR: &str = "||";

/// Version tag written into every encoded observation.
pub const OBSERVATION_FORMAT_VERSION: u32 = 1;

pub type ListingId = String;
pub type RecordId = String;
pub type RevisionId = String;

/// Composite id of a project enrolled on this device.
pub fn resolve_project_id(listing_id: &str, project_id: &str) -> String {
    format!("{listing_id}{PROJECT_ID_SEPARATOR}{project_id}")
}

/// Inverse of [`resolve_project_id`]. Splits on the first separator.
pub fn split_full_project_id(active_id: &str) -> Result<(String, String), SyncError> {
    match active_id.split_once(PROJECT_ID_SEPARATOR) {
        Some((listing, project)) if !listing.is_empty() && !project.is_empty() => {
            Ok((listing.to_string(), project.to_string()))
        }
        _ => Err(SyncError::BadRequest(format!(
            "{active_id} is not a listing{PROJECT_ID_SEPARATOR}project id"
        ))),
    }
}

/// A tenant entry in the directory database, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(rename = "_id")]
    pub id: ListingId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects_db: Option<PossibleConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub people_db: Option<PossibleConnectionInfo>,
}

/// A listing whose sub-database connections are fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonNullListing {
    pub id: ListingId,
    pub name: String,
    pub description: String,
    pub projects_db: ConnectionInfo,
    pub people_db: ConnectionInfo,
}

/// Device enrollment in a project. Lives only in the local `active` store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub listing_id: ListingId,
    pub project_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ActiveDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveDoc")
            .field("id", &self.id)
            .field("listing_id", &self.listing_id)
            .field("project_id", &self.project_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A project entry in a listing's projects database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectObject {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_db: Option<PossibleConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_db: Option<PossibleConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A `namespace::name` record type, parsed once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName {
    namespace: String,
    name: String,
}

impl TypeName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, SyncError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || name.is_empty() {
            return Err(SyncError::BadRequest(format!(
                "type name needs a namespace and a name, got {namespace:?}::{name:?}"
            )));
        }
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for TypeName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(SyncError::BadRequest(format!("type {s:?} is not of the form namespace::name"))),
        }
    }
}

impl TryFrom<String> for TypeName {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeName> for String {
    fn from(value: TypeName) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.name)
    }
}

/// A record in the form UI code works with.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub observation_id: RecordId,
    /// Set once the record has been written at least once.
    pub rev: Option<RevisionId>,
    pub type_name: TypeName,
    pub data: JsonValue,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
}

impl Observation {
    /// A fresh, never-written record authored by `user` now.
    pub fn new(observation_id: impl Into<RecordId>, type_name: TypeName, data: JsonValue, user: &str) -> Self {
        let now = Utc::now();
        Self {
            observation_id: observation_id.into(),
            rev: None,
            type_name,
            data,
            created: now,
            created_by: user.to_string(),
            updated: now,
            updated_by: user.to_string(),
        }
    }

    pub fn encode(&self) -> EncodedObservation {
        EncodedObservation {
            id: self.observation_id.clone(),
            rev: self.rev.clone(),
            type_name: self.type_name.clone(),
            data: self.data.clone(),
            created: self.created,
            created_by: self.created_by.clone(),
            updated: self.updated,
            updated_by: self.updated_by.clone(),
            format_version: OBSERVATION_FORMAT_VERSION,
            deleted: false,
        }
    }
}

/// The stored form of an [`Observation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedObservation {
    #[serde(rename = "_id")]
    pub id: RecordId,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<RevisionId>,
    #[serde(rename = "type")]
    pub type_name: TypeName,
    pub data: JsonValue,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub updated: DateTime<Utc>,
    pub updated_by: String,
    pub format_version: u32,
    /// Soft-delete marker, distinct from a store tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl EncodedObservation {
    pub fn decode(self) -> Observation {
        Observation {
            observation_id: self.id,
            rev: self.rev,
            type_name: self.type_name,
            data: self.data,
            created: self.created,
            created_by: self.created_by,
            updated: self.updated,
            updated_by: self.updated_by,
        }
    }
}
