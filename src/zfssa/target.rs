//! SAN target-group operations.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// A SAN target group: a named set of targets a LUN is exported through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TargetGroupEnvelope {
    group: TargetGroup,
}

impl ZfssaClient {
    /// Fetches one target group of `protocol` (e.g. `iscsi`).
    pub async fn get_target_group(
        &self,
        token: &Token,
        protocol: &str,
        group: &str,
    ) -> Result<TargetGroup, CsiError> {
        let url = self.target_group_url(protocol, group);
        let envelope: TargetGroupEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await?;
        Ok(envelope.group)
    }
}
