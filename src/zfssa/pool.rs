//! Storage pool operations.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// Space accounting of a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolUsage {
    #[serde(default)]
    pub available: i64,
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub free: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub usage_snapshots: i64,
    #[serde(default)]
    pub usage_data: i64,
}

/// A storage pool as reported by the appliance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub usage: PoolUsage,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub asn: String,
}

#[derive(Debug, Deserialize)]
struct PoolEnvelope {
    pool: Pool,
}

impl ZfssaClient {
    /// Fetches one pool. Any failure surfaces as *not-found* since create
    /// validation is the only caller that cares why.
    pub async fn get_pool(&self, token: &Token, name: &str) -> Result<Pool, CsiError> {
        let url = self.pool_url(name);
        let envelope: PoolEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await
            .map_err(|e| {
                tracing::warn!(pool = name, error = %e, "pool lookup failed");
                CsiError::NotFound(format!("pool not found ({name})"))
            })?;
        Ok(envelope.pool)
    }

    /// Fetches every pool on the appliance.
    pub async fn get_pools(&self, token: &Token) -> Result<Vec<Pool>, CsiError> {
        self.request_list(token, &self.pools_url()).await
    }
}
