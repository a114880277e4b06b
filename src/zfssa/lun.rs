//! iSCSI LUN operations, including the initiator-group masking that encodes
//! publication state on the appliance itself.

use std::collections::HashMap;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// Block size used when the storage class does not supply one.
pub const DEFAULT_LUN_BLOCK_SIZE: i64 = 8192;

/// The distinguished initiator-group name that makes a LUN unreachable.
/// A LUN whose initiator-group list is exactly `[MASK_ALL]` is unpublished
/// and owned by this driver; anything else belongs to somebody.
pub const MASK_ALL: &str = "com.sun.ms.vss.hg.maskAll";

/// A LUN as reported by the appliance. Sizes arrive as floating point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lun {
    #[serde(default)]
    pub space_data: f64,
    #[serde(default)]
    pub canonical_name: String,
    #[serde(default, rename = "volsize")]
    pub volume_size: f64,
    #[serde(default, rename = "volblocksize")]
    pub volume_block_size: i64,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub href: String,
    #[serde(default, rename = "assignednumber")]
    pub assigned_number: Vec<i32>,
    #[serde(default, rename = "initiatorgroup")]
    pub initiator_group: Vec<String>,
    #[serde(default, rename = "targetgroup")]
    pub target_group: String,
}

#[derive(Debug, Deserialize)]
struct LunEnvelope {
    lun: Lun,
}

#[derive(Debug, Serialize)]
struct CreateLunRequest {
    name: String,
    #[serde(rename = "volsize")]
    volume_size: i64,
    #[serde(rename = "volblocksize")]
    volume_block_size: i64,
    #[serde(rename = "targetgroup")]
    target_group: String,
    sparse: bool,
    #[serde(rename = "initiatorgroup")]
    initiator_group: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InitiatorGroups {
    #[serde(rename = "initiatorgroup")]
    initiator_group: Vec<String>,
}

impl ZfssaClient {
    /// Creates a LUN of `size` bytes, expecting 201.
    ///
    /// The block size comes from the `blockSize` parameter (8192 when absent
    /// or unparsable) and provisioning is dense unless `volumeType` is
    /// `thin`. The initiator group always starts masked so the LUN is born
    /// unpublished.
    pub async fn create_lun(
        &self,
        token: &Token,
        name: &str,
        size: i64,
        parameters: &HashMap<String, String>,
    ) -> Result<Lun, CsiError> {
        let pool = parameters.get("pool").map(String::as_str).unwrap_or("");
        let project = parameters.get("project").map(String::as_str).unwrap_or("");
        let url = self.luns_url(pool, project);

        let block_size = parameters
            .get("blockSize")
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or_else(|| {
                debug!(default = DEFAULT_LUN_BLOCK_SIZE, "using the default block size");
                DEFAULT_LUN_BLOCK_SIZE
            });
        let sparse = parameters.get("volumeType").map(String::as_str) == Some("thin");

        let body = CreateLunRequest {
            name: name.to_owned(),
            volume_size: size,
            volume_block_size: block_size,
            target_group: parameters
                .get("targetGroup")
                .cloned()
                .unwrap_or_default(),
            sparse,
            initiator_group: vec![MASK_ALL.to_owned()],
        };

        let envelope: LunEnvelope = self
            .request(token, Method::POST, &url, Some(&body), StatusCode::CREATED)
            .await?;
        Ok(envelope.lun)
    }

    pub async fn get_lun(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
        name: &str,
    ) -> Result<Lun, CsiError> {
        let url = self.lun_url(pool, project, name);
        let envelope: LunEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await?;
        Ok(envelope.lun)
    }

    /// Lists the LUNs of a pool/project pair, or of the whole appliance when
    /// both are empty. Mixed scoping is rejected.
    pub async fn get_luns(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
    ) -> Result<Vec<Lun>, CsiError> {
        let url = match (pool.is_empty(), project.is_empty()) {
            (false, false) => self.luns_url(pool, project),
            (true, true) => self.all_luns_url(),
            _ => {
                return Err(CsiError::InvalidArgument(
                    "pool and project must be supplied together or not at all".into(),
                ))
            }
        };
        self.request_list(token, &url).await
    }

    pub async fn delete_lun(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
        name: &str,
    ) -> Result<(), CsiError> {
        let url = self.lun_url(pool, project, name);
        self.request_empty::<()>(token, Method::DELETE, &url, None, StatusCode::NO_CONTENT)
            .await?;
        Ok(())
    }

    /// Reads a LUN's current initiator-group list.
    pub async fn get_initiator_group_list(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
        name: &str,
    ) -> Result<Vec<String>, CsiError> {
        let lun = self.get_lun(token, pool, project, name).await?;
        Ok(lun.initiator_group)
    }

    /// Overwrites a LUN's initiator-group list with a single group,
    /// expecting 202.
    pub async fn set_initiator_group_list(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
        name: &str,
        group: &str,
    ) -> Result<(), CsiError> {
        let url = self.lun_url(pool, project, name);
        let body = InitiatorGroups {
            initiator_group: vec![group.to_owned()],
        };
        debug!(lun = name, group, "rewriting the initiator group list");
        self.request_empty(token, Method::PUT, &url, Some(&body), StatusCode::ACCEPTED)
            .await?;
        Ok(())
    }

    /// Clones a LUN snapshot into a new LUN, expecting 201.
    pub async fn clone_lun_snapshot(
        &self,
        token: &Token,
        snapshot_href: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Lun, CsiError> {
        let url = self.href_url(&format!("{snapshot_href}/clone"));
        let envelope: LunEnvelope = self
            .request(token, Method::PUT, &url, Some(parameters), StatusCode::CREATED)
            .await?;
        Ok(envelope.lun)
    }
}
