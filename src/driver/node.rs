//! Node service implementation: iSCSI attach plus bind mount for block
//! volumes, NFS mounts for filesystems.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::error::CsiError;
use crate::id::VolumeId;
use crate::node::CsiNode;
use crate::types::{
    AccessType, NodeCapability, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};
use crate::zfssa::token::Token;

use super::iscsi::{connector_from_file, persist_connector, Connector};
use super::ZfssaDriver;

/// Capabilities this node service actually implements. Expansion is absent:
/// appliance-side expansion needs no node involvement.
const NODE_CAPS: [NodeCapability; 1] = [NodeCapability::StageUnstageVolume];

/// Where the iSCSI connection record of a published volume lives: next to
/// the bind-mount target, named after the volume.
fn connector_record_path(target_path: &str, volume_name: &str) -> PathBuf {
    let target = Path::new(target_path);
    target
        .parent()
        .unwrap_or(target)
        .join(format!("{volume_name}.json"))
}

impl ZfssaDriver {
    /// Attaches the LUN backing `vid` and returns the local device path.
    async fn attach_block_volume(
        &self,
        token: &Token,
        req: &NodePublishVolumeRequest,
        vid: &VolumeId,
    ) -> Result<(String, Connector), CsiError> {
        // Pick up LUNs that appeared since the last login.
        self.iscsi.rescan().await?;

        let lun = self
            .client
            .get_lun(token, &vid.pool, &vid.project, &vid.name)
            .await?;
        let group = self
            .client
            .get_target_group(token, "iscsi", &lun.target_group)
            .await?;
        let target_iqn = group
            .targets
            .first()
            .ok_or_else(|| {
                CsiError::Internal(format!(
                    "target group ({}) has no targets",
                    lun.target_group
                ))
            })?
            .clone();
        let assigned = lun.assigned_number.first().copied().ok_or_else(|| {
            CsiError::Internal(format!("lun ({}) has no assigned number", vid.name))
        })?;

        let connector =
            Connector::from_publish_context(&vid.name, &req.volume_context, &target_iqn, assigned)?;
        debug!(
            iqn = %connector.target_iqn,
            portals = ?connector.target_portals,
            lun = connector.lun,
            "connecting iSCSI disk"
        );
        let device = self.iscsi.connect(&connector).await?;
        if device.is_empty() {
            return Err(CsiError::Internal(
                "connect reported success, but no device path returned".into(),
            ));
        }
        Ok((device, connector))
    }

    async fn node_publish_block(
        &self,
        token: &Token,
        req: &NodePublishVolumeRequest,
        vid: &VolumeId,
        mut mount_options: Vec<String>,
    ) -> Result<(), CsiError> {
        let target = &req.target_path;
        let (device, connector) = self.attach_block_volume(token, req, vid).await?;
        debug!(device, path = %target, "publishing block device");

        // The bind-mount target's parent is created on demand.
        let parent = Path::new(target)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        if !parent.exists() {
            std::fs::create_dir_all(&parent).map_err(|e| {
                CsiError::Internal(format!("could not create dir {}: {e}", parent.display()))
            })?;
        }

        // Keep the connection record for the eventual detach.
        persist_connector(&connector, &connector_record_path(target, &vid.name))?;

        self.mounter.make_file(Path::new(target))?;

        if let Some(cap) = &req.volume_capability {
            mount_options.extend(cap.mount_flags.iter().cloned());
        }
        if let Err(e) = self.mounter.mount(&device, target, None, &mount_options) {
            if let Err(remove_err) = std::fs::remove_file(target) {
                warn!(path = %target, error = %remove_err, "could not remove the mount target");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn node_unpublish_block(
        &self,
        req: &NodeUnpublishVolumeRequest,
        vid: &VolumeId,
    ) -> Result<(), CsiError> {
        let target = &req.target_path;
        if !Path::new(target).exists() {
            debug!(path = %target, "unpublish target is already gone");
            return Ok(());
        }

        let (device, references) = self.mounter.get_device_name(Path::new(target))?;
        self.mounter.unmount(target)?;

        // Only the last reference tears the session down.
        if references > 1 {
            debug!(device, references, "device still referenced, keeping the session");
            return Ok(());
        }

        let record = connector_record_path(target, &vid.name);
        match connector_from_file(&record) {
            Ok(connector) => {
                self.iscsi.disconnect(&connector).await?;
                if let Err(e) = std::fs::remove_file(&record) {
                    debug!(record = %record.display(), error = %e, "connection record removal failed");
                }
            }
            // A missing record is not fatal; the session may predate us or
            // the record may have been cleaned up already.
            Err(e) => debug!(error = %e, "no connection record for detach"),
        }

        if let Err(e) = std::fs::remove_file(target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CsiError::Internal(format!(
                    "could not remove target {target}: {e}"
                )));
            }
        }
        Ok(())
    }

    fn node_publish_filesystem(
        &self,
        req: &NodePublishVolumeRequest,
        mut mount_options: Vec<String>,
    ) -> Result<(), CsiError> {
        let target = &req.target_path;
        let not_mounted = match self.mounter.is_likely_not_mount_point(Path::new(target)) {
            Ok(not_mounted) => not_mounted,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(target).map_err(|e| {
                    CsiError::Internal(format!("could not create dir {target}: {e}"))
                })?;
                true
            }
            Err(e) => return Err(CsiError::Internal(e.to_string())),
        };
        if !not_mounted {
            debug!(path = %target, "target is already mounted");
            return Ok(());
        }

        let server = req
            .volume_context
            .get("nfsServer")
            .map(String::as_str)
            .unwrap_or("");
        // Statically provisioned shares carry no mountpoint; fall back to
        // the share context entry.
        let export = req
            .volume_context
            .get("mountpoint")
            .or_else(|| req.volume_context.get("share"))
            .map(String::as_str)
            .unwrap_or("");
        if server.is_empty() || export.is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "NFS mount information is missing (server={server}, export={export})"
            )));
        }

        if let Some(cap) = &req.volume_capability {
            mount_options.extend(cap.mount_flags.iter().cloned());
        }
        let source = format!("{server}:{export}");
        debug!(source, path = %target, "mounting NFS share");
        self.mounter
            .mount(&source, target, Some("nfs"), &mount_options)
    }

    fn node_unpublish_filesystem(&self, req: &NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
        let target = &req.target_path;
        if !Path::new(target).exists() {
            debug!(path = %target, "unpublish target is already gone");
            return Ok(());
        }

        self.mounter.unmount(target)?;

        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(target))
            .map_err(|e| CsiError::Internal(e.to_string()))?;
        if not_mounted {
            std::fs::remove_dir(target).map_err(|e| {
                CsiError::Internal(format!("could not remove target {target}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl CsiNode for ZfssaDriver {
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path not provided".into()));
        }
        if req.volume_capability.is_none() {
            return Err(CsiError::InvalidArgument("capability not provided".into()));
        }
        // Neither volume kind needs per-node staging.
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        let target = &req.staging_target_path;
        if target.is_empty() {
            return Err(CsiError::InvalidArgument(
                "staging target not provided".into(),
            ));
        }

        let (device, references) = self.mounter.get_device_name(Path::new(target))?;
        if references == 0 {
            debug!(path = %target, "staging target not mounted");
            return Ok(());
        }
        if references > 1 {
            warn!(device, references, path = %target, "device is still referenced elsewhere");
        }

        self.mounter.unmount(target)?;
        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(target))
            .map_err(|e| CsiError::Internal(e.to_string()))?;
        if not_mounted {
            if let Err(e) = std::fs::remove_dir_all(target) {
                return Err(CsiError::Internal(format!(
                    "could not remove staging target {target}: {e}"
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path not provided".into()));
        }
        let Some(capability) = req.volume_capability.clone() else {
            return Err(CsiError::InvalidArgument(
                "volume capability not provided".into(),
            ));
        };

        let vid = VolumeId::from_str(&req.volume_id)?;
        let token = self.login(&req.secrets)?;

        let mut mount_options = Vec::new();
        if req.readonly {
            mount_options.push("ro".to_owned());
        }

        match capability.access_type {
            AccessType::Block => {
                mount_options.push("bind".to_owned());
                self.node_publish_block(&token, &req, &vid, mount_options)
                    .await
            }
            AccessType::Mount => self.node_publish_filesystem(&req, mount_options),
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path not provided".into()));
        }
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        let vid = VolumeId::from_str(&req.volume_id)?;

        if vid.is_block() {
            self.node_unpublish_block(&req, &vid).await
        } else {
            self.node_unpublish_filesystem(&req)
        }
    }

    async fn node_get_info(&self) -> Result<NodeGetInfoResponse, CsiError> {
        Ok(NodeGetInfoResponse {
            node_id: self.config.node_name.clone(),
        })
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(NODE_CAPS.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_record_lives_beside_the_target() {
        assert_eq!(
            connector_record_path("/var/lib/kubelet/publish/v1/mount", "v1"),
            PathBuf::from("/var/lib/kubelet/publish/v1/v1.json")
        );
    }
}
