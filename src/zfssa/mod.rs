//! Typed REST client for the ZFS Storage Appliance.
//!
//! All appliance traffic flows through [`ZfssaClient::request`]: it attaches
//! the caller's session token, marshals the JSON body, checks the response
//! status against the caller's expectation, and decodes appliance fault
//! objects into [`CsiError`]. A 401 is absorbed once per request by renewing
//! the session token (see [`token`]).
//!
//! | Module | Appliance surface |
//! |---|---|
//! | [`token`] | `/api/access/v2` session tokens |
//! | [`pool`] | storage pools |
//! | [`project`] | projects |
//! | [`filesystem`] | NFS filesystems |
//! | [`lun`] | iSCSI LUNs and initiator groups |
//! | [`snapshot`] | snapshots, clones, dependents |
//! | [`target`] | SAN target groups |

pub mod filesystem;
pub mod lun;
pub mod pool;
pub mod project;
pub mod snapshot;
pub mod target;
pub mod token;

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Certificate, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CsiError;
use token::{Token, TokenRegistry};

pub use filesystem::Filesystem;
pub use lun::{Lun, DEFAULT_LUN_BLOCK_SIZE, MASK_ALL};
pub use pool::Pool;
pub use project::Project;
pub use snapshot::{Dependent, Snapshot};
pub use target::TargetGroup;

/// Appliance management port.
const APPLIANCE_PORT: u16 = 215;
/// Per-host idle connection cap.
const MAX_IDLE_PER_HOST: usize = 16;
/// Idle connection timeout.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct FaultInfo {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    #[serde(default, rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct FaultResponse {
    fault: FaultInfo,
}

/// A registered appliance service, as reported by the access endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uri: String,
}

/// HTTPS client for one appliance.
pub struct ZfssaClient {
    http: reqwest::Client,
    base: String,
    appliance: String,
    tokens: TokenRegistry,
}

impl ZfssaClient {
    /// Builds a client for `appliance`, reachable on the management port.
    ///
    /// With `secure`, the trust store is the system roots plus the supplied
    /// PEM bundle and TLS 1.2 is the floor; otherwise certificate
    /// verification is disabled entirely.
    pub fn new(appliance: &str, certs: Option<&[u8]>, secure: bool) -> Result<Self, CsiError> {
        let mut builder = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT);

        if secure {
            if let Some(pem) = certs {
                for cert in Certificate::from_pem_bundle(pem)
                    .map_err(|e| CsiError::Internal(format!("failed to load certificates: {e}")))?
                {
                    builder = builder.add_root_certificate(cert);
                }
            }
        } else {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| CsiError::Internal(format!("failed to build the HTTP client: {e}")))?;

        Ok(Self {
            http,
            base: format!("https://{appliance}:{APPLIANCE_PORT}"),
            appliance: appliance.to_owned(),
            tokens: TokenRegistry::new(),
        })
    }

    /// Builds a client whose URLs are rooted at an arbitrary base instead of
    /// `https://{appliance}:215`. Intended for exercising the driver against
    /// a stand-in appliance.
    pub fn with_base_url(appliance: &str, base: &str) -> Result<Self, CsiError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()
            .map_err(|e| CsiError::Internal(format!("failed to build the HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_owned(),
            appliance: appliance.to_owned(),
            tokens: TokenRegistry::new(),
        })
    }

    /// Name of the appliance this client talks to.
    pub fn appliance(&self) -> &str {
        &self.appliance
    }

    /// Looks up (or creates) the session token record for `user`.
    pub fn token(&self, user: &str, password: &str) -> std::sync::Arc<Token> {
        self.tokens.lookup(&self.appliance, user, password)
    }

    // -- URL templates ------------------------------------------------------

    pub(crate) fn access_url(&self) -> String {
        format!("{}/api/access/v2", self.base)
    }

    fn storage_url(&self, path: &str) -> String {
        format!("{}/api/storage/v2{path}", self.base)
    }

    pub(crate) fn pools_url(&self) -> String {
        self.storage_url("/pools")
    }

    pub(crate) fn pool_url(&self, pool: &str) -> String {
        self.storage_url(&format!("/pools/{pool}"))
    }

    pub(crate) fn project_url(&self, pool: &str, project: &str) -> String {
        self.storage_url(&format!("/pools/{pool}/projects/{project}"))
    }

    pub(crate) fn projects_url(&self, pool: &str) -> String {
        self.storage_url(&format!("/pools/{pool}/projects"))
    }

    pub(crate) fn all_projects_url(&self) -> String {
        self.storage_url("/projects")
    }

    pub(crate) fn filesystems_url(&self, pool: &str, project: &str) -> String {
        self.storage_url(&format!("/pools/{pool}/projects/{project}/filesystems"))
    }

    pub(crate) fn filesystem_url(&self, pool: &str, project: &str, name: &str) -> String {
        self.storage_url(&format!(
            "/pools/{pool}/projects/{project}/filesystems/{name}"
        ))
    }

    pub(crate) fn all_filesystems_url(&self) -> String {
        self.storage_url("/filesystems")
    }

    pub(crate) fn luns_url(&self, pool: &str, project: &str) -> String {
        self.storage_url(&format!("/pools/{pool}/projects/{project}/luns"))
    }

    pub(crate) fn lun_url(&self, pool: &str, project: &str, name: &str) -> String {
        self.storage_url(&format!("/pools/{pool}/projects/{project}/luns/{name}"))
    }

    pub(crate) fn all_luns_url(&self) -> String {
        self.storage_url("/luns")
    }

    pub(crate) fn all_snapshots_url(&self) -> String {
        self.storage_url("/snapshots")
    }

    pub(crate) fn target_group_url(&self, protocol: &str, group: &str) -> String {
        format!("{}/api/san/v2/{protocol}/target-groups/{group}", self.base)
    }

    /// Resolves an appliance-relative href (as returned inside appliance
    /// records) into an absolute URL.
    pub(crate) fn href_url(&self, href: &str) -> String {
        format!("{}{href}", self.base)
    }

    // -- Request core -------------------------------------------------------

    /// Sends one request, transparently retrying once after a 401 by
    /// renewing the session token. Returns the response status and body.
    async fn send(
        &self,
        token: &Token,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), CsiError> {
        let mut session = token.session(&self.http, &self.access_url(), None).await?;
        let mut renewed = false;

        loop {
            debug!(method = %method, url, "appliance request");
            let mut req = self
                .http
                .request(method.clone(), url)
                .header("X-Auth-Session", &session)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json");
            if let Some(ref payload) = body {
                req = req.body(payload.clone());
            }

            let rsp = req
                .send()
                .await
                .map_err(|e| CsiError::Internal(format!("appliance request failed: {e}")))?;
            let status = rsp.status();

            if status == StatusCode::UNAUTHORIZED && !renewed {
                // The session is stale; renew it and retry once. The stale
                // session is passed along so the token module only rotates
                // when no other requester already has.
                debug!(url, "session rejected, renewing token");
                session = token
                    .session(&self.http, &self.access_url(), Some(&session))
                    .await?;
                renewed = true;
                continue;
            }

            let bytes = rsp
                .bytes()
                .await
                .map_err(|e| CsiError::Internal(format!("failed to read the response: {e}")))?;
            return Ok((status, bytes.to_vec()));
        }
    }

    /// Decodes the body of a non-expected status into an error, preferring
    /// the appliance's embedded fault message.
    fn unexpected_status(method: &Method, url: &str, status: StatusCode, body: &[u8]) -> CsiError {
        let message = match serde_json::from_slice::<FaultResponse>(body) {
            Ok(fault) => {
                debug!(code = fault.fault.code, name = %fault.fault.name, "appliance fault");
                fault.fault.message
            }
            Err(_) => String::from_utf8_lossy(body).into_owned(),
        };
        warn!(method = %method, url, status = status.as_u16(), %message, "unexpected appliance status");

        if status == StatusCode::UNAUTHORIZED {
            return CsiError::Unauthenticated("appliance rejected the renewed session".into());
        }
        if status == StatusCode::NOT_FOUND {
            return CsiError::NotFound(format!("resource not found on target appliance: {message}"));
        }
        CsiError::Appliance {
            status: status.as_u16(),
            message,
        }
    }

    /// Performs a request whose success response carries a JSON object.
    pub(crate) async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        token: &Token,
        method: Method,
        url: &str,
        body: Option<&B>,
        expected: StatusCode,
    ) -> Result<R, CsiError> {
        let payload = match body {
            Some(b) => Some(
                serde_json::to_vec(b)
                    .map_err(|e| CsiError::Internal(format!("failed to marshal request: {e}")))?,
            ),
            None => None,
        };
        let (status, bytes) = self.send(token, method.clone(), url, payload).await?;
        if status != expected {
            return Err(Self::unexpected_status(&method, url, status, &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CsiError::Internal(format!("failed to unmarshal response: {e}")))
    }

    /// Performs a request whose success response body is irrelevant.
    /// Any 2xx answer is accepted when `expected` is 2xx.
    pub(crate) async fn request_empty<B: Serialize>(
        &self,
        token: &Token,
        method: Method,
        url: &str,
        body: Option<&B>,
        expected: StatusCode,
    ) -> Result<StatusCode, CsiError> {
        let payload = match body {
            Some(b) => Some(
                serde_json::to_vec(b)
                    .map_err(|e| CsiError::Internal(format!("failed to marshal request: {e}")))?,
            ),
            None => None,
        };
        let (status, bytes) = self.send(token, method.clone(), url, payload).await?;
        if status != expected && !(expected.is_success() && status.is_success()) {
            return Err(Self::unexpected_status(&method, url, status, &bytes));
        }
        Ok(status)
    }

    /// Performs a GET whose success response is an appliance list envelope.
    pub(crate) async fn request_list<T: DeserializeOwned>(
        &self,
        token: &Token,
        url: &str,
    ) -> Result<Vec<T>, CsiError> {
        let (status, bytes) = self.send(token, Method::GET, url, None).await?;
        if status != StatusCode::OK {
            return Err(Self::unexpected_status(&Method::GET, url, status, &bytes));
        }
        parse_list(&bytes)
    }

    // -- Health -------------------------------------------------------------

    /// Lists the appliance services. Used by the readiness probe: a
    /// successful answer proves reachability and valid credentials.
    pub async fn get_services(&self, token: &Token) -> Result<Vec<Service>, CsiError> {
        self.request_list(token, &self.access_url()).await
    }
}

/// Unwraps the appliance's non-standard list envelope.
///
/// List responses arrive as `{"things":[{...},...,{...}]}`; the standard
/// parser wants the bare array. The envelope key varies by resource, so the
/// outer object is stripped positionally: drop the final `}` and everything
/// up to the first `[`.
pub(crate) fn parse_list<T: DeserializeOwned>(body: &[u8]) -> Result<Vec<T>, CsiError> {
    let inner = body
        .len()
        .checked_sub(1)
        .map(|end| &body[..end])
        .and_then(|trimmed| {
            trimmed
                .iter()
                .position(|&b| b == b'[')
                .map(|start| &trimmed[start..])
        })
        .ok_or_else(|| CsiError::Internal("malformed appliance list response".into()))?;
    serde_json::from_slice(inner)
        .map_err(|e| CsiError::Internal(format!("failed to unmarshal list response: {e}")))
}
