//! iSCSI session collaborator.
//!
//! The [`IscsiSession`] trait is the seam between the block publish protocol
//! and the host's open-iscsi stack. [`IscsiAdm`] implements it by shelling
//! out to `iscsiadm`, the way the surrounding tooling does. The
//! [`Connector`] record captures everything needed to log in to (and later
//! out of) a target; it is persisted next to the publish target so a detach
//! after a driver restart still knows what to tear down.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CsiError;

/// `iscsiadm` exit code for "no objects found"; a rescan with no sessions is
/// not an error.
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// Default iSCSI portal port.
const DEFAULT_PORTAL_PORT: &str = "3260";

/// How long to wait for the block device node to appear after login.
const DEVICE_WAIT: Duration = Duration::from_secs(10);
const DEVICE_POLL: Duration = Duration::from_millis(500);

/// CHAP secrets for one authentication family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapSecrets {
    pub username: String,
    pub password: String,
    pub username_in: String,
    pub password_in: String,
}

/// Everything needed to reach a LUN over iSCSI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub volume_name: String,
    pub target_iqn: String,
    pub target_portals: Vec<String>,
    pub lun: i32,
    pub multipath: bool,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub initiator_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_secrets: Option<ChapSecrets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_secrets: Option<ChapSecrets>,
}

/// Appends the default port when the portal carries none.
fn portal_address(portal: &str) -> String {
    if portal.contains(':') {
        portal.to_owned()
    } else {
        format!("{portal}:{DEFAULT_PORTAL_PORT}")
    }
}

fn parse_secret_map(raw: &str) -> Option<HashMap<String, String>> {
    serde_json::from_str(raw).ok()
}

fn chap_from_map(
    map: &HashMap<String, String>,
    prefix: &str,
) -> Result<Option<ChapSecrets>, CsiError> {
    if map.is_empty() {
        return Ok(None);
    }
    let field = |suffix: &str| {
        map.get(&format!("{prefix}.{suffix}")).cloned().ok_or_else(|| {
            CsiError::InvalidArgument(format!("{prefix}.{suffix} not found in secret"))
        })
    };
    Ok(Some(ChapSecrets {
        username: field("username")?,
        password: field("password")?,
        username_in: field("username_in")?,
        password_in: field("password_in")?,
    }))
}

impl Connector {
    /// Assembles a connection record from a publish request's volume
    /// context.
    ///
    /// The portal list is the `targetPortal` entry plus the `portals` JSON
    /// array, all defaulted to port 3260. CHAP secrets come from the
    /// `secret` JSON map; each family applies only when its
    /// `sessionCHAPAuth` / `discoveryCHAPAuth` flag is `"true"`.
    pub fn from_publish_context(
        volume_name: &str,
        context: &HashMap<String, String>,
        target_iqn: &str,
        lun: i32,
    ) -> Result<Self, CsiError> {
        let target_portal = context
            .get("targetPortal")
            .map(String::as_str)
            .unwrap_or("");
        if target_portal.is_empty() || target_iqn.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "iSCSI target information is missing (portal={target_portal}, iqn={target_iqn})"
            )));
        }

        let mut portals = vec![portal_address(target_portal)];
        let extra = context.get("portals").map(String::as_str).unwrap_or("[]");
        let extra: Vec<String> = serde_json::from_str(extra)
            .map_err(|e| CsiError::InvalidArgument(format!("invalid portals list: {e}")))?;
        portals.extend(extra.iter().map(|p| portal_address(p)));

        let secret = context
            .get("secret")
            .and_then(|raw| parse_secret_map(raw))
            .unwrap_or_default();

        let chap_session = context.get("sessionCHAPAuth").map(String::as_str) == Some("true");
        let chap_discovery = context.get("discoveryCHAPAuth").map(String::as_str) == Some("true");

        let session_secrets = if chap_session {
            chap_from_map(&secret, "node.session.auth")?
        } else {
            None
        };
        let discovery_secrets = if chap_discovery {
            chap_from_map(&secret, "node.sendtargets.auth")?
        } else {
            None
        };

        Ok(Connector {
            volume_name: volume_name.to_owned(),
            target_iqn: target_iqn.to_owned(),
            multipath: portals.len() > 1,
            target_portals: portals,
            lun,
            interface: context
                .get("iscsiInterface")
                .cloned()
                .unwrap_or_default(),
            initiator_name: context.get("initiatorName").cloned().unwrap_or_default(),
            session_secrets,
            discovery_secrets,
        })
    }

    /// Expected device node for one portal of this connector.
    fn device_path(&self, portal: &str) -> String {
        format!(
            "/dev/disk/by-path/ip-{portal}-iscsi-{}-lun-{}",
            self.target_iqn, self.lun
        )
    }
}

/// Persists the connection record for a later detach.
pub fn persist_connector(connector: &Connector, path: &Path) -> Result<(), CsiError> {
    let payload = serde_json::to_vec(connector)
        .map_err(|e| CsiError::Internal(format!("failed to serialize the connection record: {e}")))?;
    std::fs::write(path, payload).map_err(|e| {
        CsiError::Internal(format!(
            "failed to persist the connection record at {}: {e}",
            path.display()
        ))
    })
}

/// Reads a previously persisted connection record.
pub fn connector_from_file(path: &Path) -> Result<Connector, CsiError> {
    let raw = std::fs::read(path).map_err(|e| {
        CsiError::NotFound(format!(
            "connection record {} could not be read: {e}",
            path.display()
        ))
    })?;
    serde_json::from_slice(&raw)
        .map_err(|e| CsiError::Internal(format!("corrupt connection record: {e}")))
}

/// iSCSI operations the node service depends on.
#[async_trait]
pub trait IscsiSession: Send + Sync {
    /// Rescans existing sessions. "No sessions" is not an error.
    async fn rescan(&self) -> Result<(), CsiError>;

    /// Connects to the target and returns the block device path.
    async fn connect(&self, connector: &Connector) -> Result<String, CsiError>;

    /// Logs out of the target on every portal.
    async fn disconnect(&self, connector: &Connector) -> Result<(), CsiError>;
}

/// Production implementation shelling out to `iscsiadm`.
#[derive(Default)]
pub struct IscsiAdm;

impl IscsiAdm {
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<String, CsiError> {
        let output = Command::new("iscsiadm")
            .args(args)
            .output()
            .await
            .map_err(|e| CsiError::Internal(format!("iscsiadm could not be run: {e}")))?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(CsiError::Internal(format!(
                "iscsiadm {} failed (code {:?}): {}",
                args.join(" "),
                output.status.code(),
                combined.replace('\n', " ")
            )));
        }
        Ok(combined)
    }

    async fn update_node_param(
        target: &str,
        portal: &str,
        name: &str,
        value: &str,
    ) -> Result<(), CsiError> {
        Self::run(&[
            "-m", "node", "-T", target, "-p", portal, "--op", "update", "-n", name, "-v", value,
        ])
        .await
        .map(|_| ())
    }

    async fn apply_session_chap(connector: &Connector, portal: &str) -> Result<(), CsiError> {
        let Some(secrets) = &connector.session_secrets else {
            return Ok(());
        };
        let target = &connector.target_iqn;
        Self::update_node_param(target, portal, "node.session.auth.authmethod", "CHAP").await?;
        Self::update_node_param(target, portal, "node.session.auth.username", &secrets.username)
            .await?;
        Self::update_node_param(target, portal, "node.session.auth.password", &secrets.password)
            .await?;
        if !secrets.username_in.is_empty() {
            Self::update_node_param(
                target,
                portal,
                "node.session.auth.username_in",
                &secrets.username_in,
            )
            .await?;
            Self::update_node_param(
                target,
                portal,
                "node.session.auth.password_in",
                &secrets.password_in,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IscsiSession for IscsiAdm {
    async fn rescan(&self) -> Result<(), CsiError> {
        let output = Command::new("iscsiadm")
            .args(["-m", "session", "--rescan"])
            .output()
            .await
            .map_err(|e| CsiError::Internal(format!("iscsiadm could not be run: {e}")))?;
        if output.status.success() || output.status.code() == Some(ISCSI_ERR_NO_OBJS_FOUND) {
            if output.status.code() == Some(ISCSI_ERR_NO_OBJS_FOUND) {
                debug!("iscsiadm reported no sessions, continuing");
            }
            return Ok(());
        }
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Err(CsiError::Internal(format!(
            "iscsiadm rescan failed (code {:?}): {}",
            output.status.code(),
            combined.replace('\n', " ")
        )))
    }

    async fn connect(&self, connector: &Connector) -> Result<String, CsiError> {
        let mut last_error = CsiError::Internal("no portals to connect to".into());

        for portal in &connector.target_portals {
            // Discover, authenticate, log in, then wait for the device node.
            let attempt: Result<String, CsiError> = async {
                Self::run(&["-m", "discovery", "-t", "sendtargets", "-p", portal.as_str()])
                    .await?;
                Self::apply_session_chap(connector, portal).await?;
                Self::run(&[
                    "-m",
                    "node",
                    "-T",
                    connector.target_iqn.as_str(),
                    "-p",
                    portal.as_str(),
                    "--login",
                ])
                .await?;

                let device = connector.device_path(portal);
                let deadline = tokio::time::Instant::now() + DEVICE_WAIT;
                while !Path::new(&device).exists() {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CsiError::Internal(format!(
                            "device {device} did not appear after login"
                        )));
                    }
                    tokio::time::sleep(DEVICE_POLL).await;
                }
                Ok(device)
            }
            .await;

            match attempt {
                Ok(device) => {
                    debug!(portal, device, "iSCSI device attached");
                    return Ok(device);
                }
                Err(e) => {
                    warn!(portal, error = %e, "iSCSI login attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn disconnect(&self, connector: &Connector) -> Result<(), CsiError> {
        for portal in &connector.target_portals {
            if let Err(e) = Self::run(&[
                "-m",
                "node",
                "-T",
                connector.target_iqn.as_str(),
                "-p",
                portal.as_str(),
                "--logout",
            ])
            .await
            {
                warn!(portal, error = %e, "iSCSI logout failed");
            }
            if let Err(e) = Self::run(&[
                "-m",
                "node",
                "-T",
                connector.target_iqn.as_str(),
                "-p",
                portal.as_str(),
                "--op",
                "delete",
            ])
            .await
            {
                debug!(portal, error = %e, "iSCSI node record removal failed");
            }
        }
        Ok(())
    }
}
