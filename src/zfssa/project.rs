//! Project operations.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::token::Token;
use super::ZfssaClient;
use crate::error::CsiError;

/// A project as reported by the appliance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub space_available: i64,
}

#[derive(Debug, Deserialize)]
struct ProjectEnvelope {
    project: Project,
}

impl ZfssaClient {
    pub async fn get_project(
        &self,
        token: &Token,
        pool: &str,
        project: &str,
    ) -> Result<Project, CsiError> {
        let url = self.project_url(pool, project);
        let envelope: ProjectEnvelope = self
            .request::<(), _>(token, Method::GET, &url, None, StatusCode::OK)
            .await?;
        Ok(envelope.project)
    }

    /// Lists the projects of `pool`, or of the whole appliance when `pool`
    /// is empty.
    pub async fn get_projects(&self, token: &Token, pool: &str) -> Result<Vec<Project>, CsiError> {
        let url = if pool.is_empty() {
            self.all_projects_url()
        } else {
            self.projects_url(pool)
        };
        self.request_list(token, &url).await
    }
}
