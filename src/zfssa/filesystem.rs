//! NFS filesystem operations.

use std::collections::HashMap;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// A filesystem share as reported by the appliance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filesystem {
    #[serde(default)]
    pub mountpoint: String,
    #[serde(default, rename = "creation")]
    pub creation_time: String,
    #[serde(default)]
    pub root_user: String,
    #[serde(default)]
    pub root_group: String,
    #[serde(default)]
    pub root_permissions: String,
    #[serde(default, rename = "rstchown")]
    pub restrict_chown: bool,
    #[serde(default, rename = "sharenfs")]
    pub share_nfs: String,
    #[serde(default)]
    pub space_data: i64,
    #[serde(default)]
    pub space_available: i64,
    #[serde(default)]
    pub canonical_name: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub reservation: i64,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct FilesystemEnvelope {
    filesystem: Filesystem,
}

/// Mapping from storage-class parameter names to appliance share properties.
const PARAMETER_PROPERTIES: [(&str, &str); 5] = [
    ("rootUser", "root_user"),
    ("rootGroup", "root_group"),
    ("rootPermissions", "root_permissions"),
    ("shareNFS", "sharenfs"),
    ("restrictChown", "rstchown"),
];

/// Builds the body of a filesystem create request: name, sizing, and the
/// recognized share properties from the storage-class parameters.
fn build_create_body(name: &str, size: i64, parameters: &HashMap<String, String>) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("name".into(), json!(name));
    body.insert("quota".into(), json!(size));
    body.insert("reservation".into(), json!(size));

    for (param, property) in PARAMETER_PROPERTIES {
        let Some(value) = parameters.get(param) else {
            continue;
        };
        if property == "rstchown" {
            let restrict = value.parse::<bool>().unwrap_or_else(|_| {
                debug!(rstchown = %value, "invalid restrict-chown value, using default: true");
                true
            });
            body.insert(property.into(), json!(restrict));
        } else {
            body.insert(property.into(), json!(value));
        }
    }

    body
}

impl ZfssaClient {
    /// Creates a filesystem of `size` bytes, expecting 201. The `pool` and
    /// `project` parameters select the container; other recognized
    /// parameters become share properties.
    pub async fn create_filesystem(
        &self,
        token: &Token,
        name: &str,
        size: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<Filesystem, CsiError> {
        let pool = parameters.get("pool").map(String::as_str).unwrap_or("");
        let project = parameters.get("project").map(String::as_str).unwrap_or("");
        let url = self.filesystems_url(pool, project);
        let body = build_create_body(name, size, parameters);
        let envelope: FilesystemEnvelope = self
            .request(token, Method::POST, &url, Some(&body), StatusCode::CREATED)
            .await?;
        Ok(envelope.filesystem)
    }

    pub async fn get_filesystem(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
        name: &str,
    ) -> Result<Filesystem, CsiError> {
        let url = self.filesystem_url(pool, project, name);
        let envelope: FilesystemEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await?;
        Ok(envelope.filesystem)
    }

    /// Lists the filesystems of a pool/project pair, or of the whole
    /// appliance when both are empty. Mixed scoping is rejected.
    pub async fn get_filesystems(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
    ) -> Result<Vec<Filesystem>, CsiError> {
        let url = match (pool.is_empty(), project.is_empty()) {
            (false, false) => self.filesystems_url(pool, project),
            (true, true) => self.all_filesystems_url(),
            _ => {
                return Err(CsiError::InvalidArgument(
                    "pool and project must be supplied together or not at all".into(),
                ))
            }
        };
        self.request_list(token, &url).await
    }

    /// Rewrites share properties in place, expecting 202.
    pub async fn modify_filesystem(
        &self,
        token: &Token,
        href: &str,
        properties: &Map<String, Value>,
    ) -> Result<Filesystem, CsiError> {
        let url = self.href_url(href);
        let envelope: FilesystemEnvelope = self
            .request(token, Method::PUT, &url, Some(properties), StatusCode::ACCEPTED)
            .await?;
        Ok(envelope.filesystem)
    }

    pub async fn delete_filesystem(&self, token: &Token, href: &str) -> Result<(), CsiError> {
        let url = self.href_url(href);
        self.request_empty::<()>(token, Method::DELETE, &url, None, StatusCode::NO_CONTENT)
            .await?;
        Ok(())
    }

    /// Clones a filesystem snapshot into a new share, expecting 201.
    pub async fn clone_filesystem_snapshot(
        &self,
        token: &Token,
        snapshot_href: &str,
        parameters: &Map<String, Value>,
    ) -> Result<Filesystem, CsiError> {
        let url = self.href_url(&format!("{snapshot_href}/clone"));
        let envelope: FilesystemEnvelope = self
            .request(token, Method::PUT, &url, Some(parameters), StatusCode::CREATED)
            .await?;
        Ok(envelope.filesystem)
    }
}
