//! Snapshot operations. The snapshot family of a volume lives under the
//! volume's href, so these calls take hrefs rather than pool/project/name
//! triples.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// A snapshot as reported by the appliance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "numclones")]
    pub num_clones: i64,
    #[serde(default, rename = "creation")]
    pub creation_time: String,
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub canonical_name: String,
    #[serde(default)]
    pub space_unique: i64,
    #[serde(default)]
    pub space_data: i64,
    #[serde(default, rename = "type")]
    pub snapshot_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotEnvelope {
    snapshot: Snapshot,
}

/// A clone depending on a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependent {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub share: String,
}

impl ZfssaClient {
    /// Creates a snapshot of the volume at `volume_href`, expecting 201.
    pub async fn create_snapshot(
        &self,
        token: &Token,
        volume_href: &str,
        name: &str,
    ) -> Result<Snapshot, CsiError> {
        let url = self.href_url(&format!("{volume_href}/snapshots"));
        let body = json!({ "name": name });
        let envelope: SnapshotEnvelope = self
            .request(token, Method::POST, &url, Some(&body), StatusCode::CREATED)
            .await?;
        Ok(envelope.snapshot)
    }

    /// Fetches one snapshot of the volume at `volume_href`.
    pub async fn get_snapshot(
        &self,
        token: &Token,
        volume_href: &str,
        name: &str,
    ) -> Result<Snapshot, CsiError> {
        let url = self.href_url(&format!("{volume_href}/snapshots/{name}"));
        let envelope: SnapshotEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await?;
        Ok(envelope.snapshot)
    }

    /// Lists the snapshots under `volume_href`, or every snapshot on the
    /// appliance when the href is empty.
    pub async fn get_snapshots(
        &self,
        token: &Token,
        volume_href: &str,
    ) -> Result<Vec<Snapshot>, CsiError> {
        let url = if volume_href.is_empty() {
            self.all_snapshots_url()
        } else {
            self.href_url(&format!("{volume_href}/snapshots"))
        };
        self.request_list(token, &url).await
    }

    /// Deletes the snapshot at `snapshot_href`, expecting 204.
    pub async fn delete_snapshot(&self, token: &Token, snapshot_href: &str) -> Result<(), CsiError> {
        let url = self.href_url(snapshot_href);
        self.request_empty::<()>(token, Method::DELETE, &url, None, StatusCode::NO_CONTENT)
            .await?;
        Ok(())
    }

    /// Lists the clones depending on the snapshot at `snapshot_href`.
    pub async fn get_snapshot_dependents(
        &self,
        token: &Token,
        snapshot_href: &str,
    ) -> Result<Vec<Dependent>, CsiError> {
        let url = self.href_url(&format!("{snapshot_href}/dependents"));
        self.request_list(token, &url).await
    }
}
