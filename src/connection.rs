//! Addresses of remote document databases.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::sync_error::{Result, SyncError};

/// Basic-auth credentials attached to a connection.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One remote document database. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub proto: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan: Option<bool>,
    pub db_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
}

impl ConnectionInfo {
    pub fn new(proto: impl Into<String>, host: impl Into<String>, port: u16, db_name: impl Into<String>) -> Self {
        Self {
            proto: proto.into(),
            host: host.into(),
            port,
            lan: None,
            db_name: db_name.into(),
            auth: None,
            jwt_token: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// The database address as a parsed URL. IPv6 hosts may be given with or
    /// without brackets; the port is omitted when it is the scheme default.
    pub fn to_url(&self) -> Result<Url> {
        let invalid = |what: &str| SyncError::BadRequest(format!("invalid {what} in {}", self.legacy_address()));

        let mut url = Url::parse(&format!("{}://localhost/", self.proto)).map_err(|_| invalid("protocol"))?;
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.path_segments_mut()
            .map_err(|_| invalid("protocol"))?
            .clear()
            .push(&self.db_name);
        Ok(url)
    }

    /// `proto://host:port/db_name`, for addressing and logs.
    pub fn url(&self) -> String {
        match self.to_url() {
            Ok(url) => url.into(),
            Err(_) => format!("{}://{}:{}/{}", self.proto, self.host, self.port, self.db_name),
        }
    }

    /// The protocol-less `host:port/db_name` form.
    pub fn legacy_address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db_name)
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new("http", "localhost", 5984, "directory")
    }
}

/// A partially specified [`ConnectionInfo`], as stored in listing and
/// project documents. Missing members are inherited from a base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossibleConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
}

impl From<&ConnectionInfo> for PossibleConnectionInfo {
    fn from(info: &ConnectionInfo) -> Self {
        Self {
            proto: Some(info.proto.clone()),
            host: Some(info.host.clone()),
            port: Some(info.port),
            lan: info.lan,
            db_name: Some(info.db_name.clone()),
            auth: info.auth.clone(),
            jwt_token: info.jwt_token.clone(),
        }
    }
}

/// Layers `overlay` over `base`. An absent overlay means the database was
/// never described, which is different from "same as base".
pub fn materialize(base: &ConnectionInfo, overlay: Option<&PossibleConnectionInfo>) -> Option<ConnectionInfo> {
    let overlay = overlay?;
    Some(ConnectionInfo {
        proto: overlay.proto.clone().unwrap_or_else(|| base.proto.clone()),
        host: overlay.host.clone().unwrap_or_else(|| base.host.clone()),
        port: overlay.port.unwrap_or(base.port),
        lan: overlay.lan.or(base.lan),
        db_name: overlay.db_name.clone().unwrap_or_else(|| base.db_name.clone()),
        auth: overlay.auth.clone().or_else(|| base.auth.clone()),
        jwt_token: overlay.jwt_token.clone().or_else(|| base.jwt_token.clone()),
    })
}
