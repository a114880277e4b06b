//! Controller service implementation.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::id::{is_resource_name_valid, snapshot_id_from_href};
use crate::registry::ResourceState;
use crate::types::*;
use crate::zfssa::token::Token;

use super::volume::{are_block_caps_valid, are_filesystem_caps_valid, is_block_request};
use super::ZfssaDriver;

/// Capabilities this controller actually implements.
const CONTROLLER_CAPS: [ControllerCapability; 7] = [
    ControllerCapability::CreateDeleteVolume,
    ControllerCapability::PublishUnpublishVolume,
    ControllerCapability::ListVolumes,
    ControllerCapability::GetCapacity,
    ControllerCapability::ExpandVolume,
    ControllerCapability::CreateDeleteSnapshot,
    ControllerCapability::ListSnapshots,
];

/// Applies the CSI pagination rules to a fully materialized entry list.
///
/// The starting token must parse as a non-negative integer (else *aborted*),
/// `max_entries` must be non-negative (else *invalid-argument*, zero meaning
/// unlimited), and the returned token is `"0"` exactly when the stream is
/// exhausted.
fn paginate<T>(
    mut entries: Vec<T>,
    starting_token: &str,
    max_entries: i32,
) -> Result<(Vec<T>, String), CsiError> {
    let start = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .map_err(|_| CsiError::Aborted("invalid starting_token value".into()))?
    };

    if max_entries < 0 {
        return Err(CsiError::InvalidArgument("invalid max_entries value".into()));
    }
    let stop = if max_entries > 0 {
        start.saturating_add(max_entries as usize)
    } else {
        usize::MAX
    };

    if start >= entries.len() {
        return Ok((Vec::new(), "0".to_owned()));
    }
    if stop >= entries.len() {
        entries.drain(..start);
        return Ok((entries, "0".to_owned()));
    }
    entries.truncate(stop);
    entries.drain(..start);
    Ok((entries, stop.to_string()))
}

impl ZfssaDriver {
    /// Validates a create request up front: capabilities, name, container
    /// names, reachability of the pool and project, and for block requests
    /// the target group.
    async fn validate_create_volume(
        &self,
        token: &Token,
        req: &CreateVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument("no access modes provided".into()));
        }
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("name must be supplied".into()));
        }

        let pool = req.parameters.get("pool").map(String::as_str).unwrap_or("");
        if !is_resource_name_valid(pool) {
            return Err(CsiError::InvalidArgument(format!(
                "pool name is invalid ({pool})"
            )));
        }
        let project = req
            .parameters
            .get("project")
            .map(String::as_str)
            .unwrap_or("");
        if !is_resource_name_valid(project) {
            return Err(CsiError::InvalidArgument(format!(
                "project name is invalid ({project})"
            )));
        }

        let pool_info = self.client.get_pool(token, pool).await?;
        if pool_info.status != "online" && pool_info.status != "degraded" {
            return Err(CsiError::InvalidArgument(format!(
                "pool {pool} is in an error state ({})",
                pool_info.status
            )));
        }
        self.client.get_project(token, pool, project).await?;

        if is_block_request(&req.volume_capabilities) {
            if !are_block_caps_valid(&req.volume_capabilities) {
                return Err(CsiError::InvalidArgument("invalid volume access modes".into()));
            }
            let target_group = req
                .parameters
                .get("targetGroup")
                .map(String::as_str)
                .unwrap_or("");
            if target_group.is_empty() {
                return Err(CsiError::InvalidArgument(
                    "a valid target group is required".into(),
                ));
            }
            self.client
                .get_target_group(token, "iscsi", target_group)
                .await?;
        } else if !are_filesystem_caps_valid(&req.volume_capabilities) {
            return Err(CsiError::InvalidArgument("invalid volume access modes".into()));
        }

        Ok(())
    }

    /// Pulls the appliance's filesystem and LUN inventories and merges them
    /// into the volume registry. Entities held by an in-flight request are
    /// skipped.
    async fn refresh_volume_inventory(&self, token: &Token) -> Result<(), CsiError> {
        let (filesystems, luns) = tokio::join!(
            self.client.get_filesystems(token, "", ""),
            self.client.get_luns(token, "", "")
        );

        for info in filesystems? {
            match self
                .new_volume(&info.pool, &info.project, &info.name, false)
                .await
            {
                Ok(handle) => {
                    handle.data_mut().set_filesystem_info(&info);
                    handle.set_state(ResourceState::Created);
                }
                Err(e) => {
                    debug!(share = %info.name, error = %e, "skipping busy share during refresh");
                }
            }
        }

        for info in luns? {
            match self
                .new_volume(&info.pool, &info.project, &info.name, true)
                .await
            {
                Ok(handle) => {
                    handle.data_mut().set_lun_info(&info);
                    handle.set_state(ResourceState::Created);
                }
                Err(e) => {
                    debug!(lun = %info.name, error = %e, "skipping busy lun during refresh");
                }
            }
        }

        Ok(())
    }

    /// Pulls the appliance's snapshot inventory and merges it into the
    /// snapshot registry. Snapshots whose href does not identify a volume
    /// snapshot are ignored.
    async fn refresh_snapshot_inventory(&self, token: &Token) -> Result<(), CsiError> {
        let snapshots = self.client.get_snapshots(token, "").await?;
        for info in snapshots {
            let Ok(sid) = snapshot_id_from_href(self.client.appliance(), &info.href) else {
                continue;
            };
            match self
                .new_snapshot(token, &info.name, &sid.volume_id.to_string())
                .await
            {
                Ok(handle) => {
                    if handle.data_mut().set_info(&info).is_ok() {
                        handle.set_state(ResourceState::Created);
                    }
                }
                Err(e) => {
                    debug!(snapshot = %info.name, error = %e, "skipping snapshot during refresh");
                }
            }
        }
        Ok(())
    }

    /// Collects the snapshot entries of one volume directly from the
    /// appliance.
    async fn volume_snapshot_entries(
        &self,
        token: &Token,
        volume_href: &str,
    ) -> Result<Vec<Snapshot>, CsiError> {
        let snapshots = self.client.get_snapshots(token, volume_href).await?;
        let appliance = self.client.appliance();
        let mut entries = Vec::with_capacity(snapshots.len());
        for info in snapshots {
            let Ok(sid) = snapshot_id_from_href(appliance, &info.href) else {
                continue;
            };
            let Ok(created_at) = crate::id::date_to_unix(&info.creation_time) else {
                continue;
            };
            entries.push(Snapshot {
                snapshot_id: sid.to_string(),
                source_volume_id: sid.volume_id.to_string(),
                size_bytes: info.space_data,
                creation_time: created_at,
                ready_to_use: true,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl CsiController for ZfssaDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let token = self.login(&req.secrets)?;
        self.validate_create_volume(&token, &req).await?;

        let pool = req.parameters.get("pool").cloned().unwrap_or_default();
        let project = req.parameters.get("project").cloned().unwrap_or_default();
        let block = is_block_request(&req.volume_capabilities);

        let handle = self.new_volume(&pool, &project, &req.name, block).await?;

        if let Some(source) = &req.content_source {
            let snapshot = self.lookup_snapshot(&token, &source.snapshot_id).await?;
            if block {
                self.clone_lun_volume(&token, &handle, &req, &snapshot).await
            } else {
                self.clone_filesystem_volume(&token, &handle, &req, &snapshot)
                    .await
            }
        } else if block {
            self.create_lun_volume(&token, &handle, &req).await
        } else {
            self.create_filesystem_volume(&token, &handle, &req).await
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        let token = self.login(&req.secrets)?;

        let handle = match self.lookup_volume(&token, &req.volume_id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                debug!(volume_id = %req.volume_id, "volume already removed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // A volume with snapshots cannot go away.
        let href = handle.data().href.clone();
        let snapshots = self.client.get_snapshots(&token, &href).await?;
        if !snapshots.is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume ({}) has snapshots",
                req.volume_id
            )));
        }

        if handle.data().is_block() {
            self.delete_lun_volume(&token, &handle).await
        } else {
            self.delete_filesystem_volume(&token, &handle).await
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        if req.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id not provided".into()));
        }
        if req.volume_capability.is_none() {
            return Err(CsiError::InvalidArgument("capability not provided".into()));
        }

        let token = self.login(&req.secrets)?;
        let handle = self.lookup_volume(&token, &req.volume_id).await?;

        if handle.data().is_block() {
            self.publish_lun_volume(&token, &handle, &req.node_id).await?;
        }
        // Filesystems publish at node-publish time; nothing to do here.
        Ok(ControllerPublishVolumeResponse::default())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        let token = self.login(&req.secrets)?;

        let handle = match self.lookup_volume(&token, &req.volume_id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => {
                debug!(volume_id = %req.volume_id, "volume already removed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if handle.data().is_block() {
            self.unpublish_lun_volume(&token, &handle).await?;
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("no volume id provided".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument("no access modes provided".into()));
        }

        let token = self.login(&req.secrets)?;
        let handle = self.lookup_volume(&token, &req.volume_id).await?;

        let valid = if handle.data().is_block() {
            are_block_caps_valid(&req.volume_capabilities)
        } else {
            are_filesystem_caps_valid(&req.volume_capabilities)
        };
        Ok(if valid {
            ValidateVolumeCapabilitiesResponse {
                confirmed: true,
                message: String::new(),
            }
        } else {
            ValidateVolumeCapabilitiesResponse {
                confirmed: false,
                message: "one or more volume access modes are unsupported".into(),
            }
        })
    }

    #[instrument(skip(self, req))]
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        let token = self.login(&std::collections::HashMap::new())?;
        self.refresh_volume_inventory(&token).await?;

        let mut entries = self.volumes.collect(|state, entity| {
            if state != ResourceState::Created {
                return None;
            }
            Some(Volume {
                volume_id: entity.id.to_string(),
                capacity_bytes: entity.capacity,
                volume_context: std::collections::HashMap::new(),
                content_source: None,
            })
        });
        // A stable order keeps repeated pages coherent.
        entries.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

        let (entries, next_token) = paginate(entries, &req.starting_token, req.max_entries)?;
        Ok(ListVolumesResponse { entries, next_token })
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, CsiError> {
        if !req.volume_capabilities.is_empty() {
            let valid = if is_block_request(&req.volume_capabilities) {
                are_block_caps_valid(&req.volume_capabilities)
            } else {
                are_filesystem_caps_valid(&req.volume_capabilities)
            };
            if !valid {
                return Err(CsiError::InvalidArgument("invalid volume access modes".into()));
            }
        }

        let token = self.login(&std::collections::HashMap::new())?;
        let pool = req.parameters.get("pool").map(String::as_str).unwrap_or("");
        let project = req
            .parameters
            .get("project")
            .map(String::as_str)
            .unwrap_or("");

        let available = if !project.is_empty() {
            if pool.is_empty() {
                return Err(CsiError::InvalidArgument("a pool name is required".into()));
            }
            self.client
                .get_project(&token, pool, project)
                .await?
                .space_available
        } else if !pool.is_empty() {
            self.client.get_pool(&token, pool).await?.usage.available
        } else {
            self.client
                .get_pools(&token)
                .await?
                .iter()
                .map(|pool| pool.usage.available)
                .sum()
        };

        Ok(GetCapacityResponse {
            available_capacity: available,
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        if req.volume_id.is_empty() {
            return Err(CsiError::InvalidArgument("volume id not provided".into()));
        }
        let token = self.login(&req.secrets)?;
        let handle = self.lookup_volume(&token, &req.volume_id).await?;

        if handle.data().is_block() {
            return Err(CsiError::OutOfRange(
                "expansion is not allowed for block devices".into(),
            ));
        }
        self.expand_filesystem_volume(&token, &handle, &req).await
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, CsiError> {
        if req.name.is_empty() || req.source_volume_id.is_empty() {
            return Err(CsiError::InvalidArgument(
                "source or snapshot id missing".into(),
            ));
        }
        let token = self.login(&req.secrets)?;
        let handle = self
            .new_snapshot(&token, &req.name, &req.source_volume_id)
            .await?;
        self.create_snapshot_on_appliance(&token, &handle).await
    }

    #[instrument(skip(self, req), fields(snapshot_id = %req.snapshot_id))]
    async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<(), CsiError> {
        if req.snapshot_id.is_empty() {
            return Err(CsiError::InvalidArgument("no snapshot id provided".into()));
        }
        let token = self.login(&req.secrets)?;

        let handle = match self.lookup_snapshot(&token, &req.snapshot_id).await {
            Ok(handle) => handle,
            // A busy snapshot means a concurrent operation; the orchestrator
            // retries. Anything else is an absent snapshot, and deleting an
            // absent snapshot succeeds.
            Err(e @ CsiError::Aborted(_)) => return Err(e),
            Err(e) => {
                debug!(snapshot_id = %req.snapshot_id, error = %e, "snapshot already removed");
                return Ok(());
            }
        };

        self.delete_snapshot_on_appliance(&token, &handle).await
    }

    #[instrument(skip(self, req))]
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError> {
        let token = self.login(&req.secrets)?;

        let entries = if !req.snapshot_id.is_empty() {
            // Exactly this snapshot; a lookup miss yields an empty page.
            match self.lookup_snapshot(&token, &req.snapshot_id).await {
                Ok(handle) => vec![handle.data().to_csi(true)],
                Err(e) => {
                    debug!(snapshot_id = %req.snapshot_id, error = %e, "snapshot listing miss");
                    Vec::new()
                }
            }
        } else if !req.source_volume_id.is_empty() {
            match self.lookup_volume(&token, &req.source_volume_id).await {
                Ok(handle) => {
                    let href = handle.data().href.clone();
                    self.volume_snapshot_entries(&token, &href)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "failed to list the volume's snapshots");
                            Vec::new()
                        })
                }
                Err(e) => {
                    debug!(source = %req.source_volume_id, error = %e, "source volume miss");
                    Vec::new()
                }
            }
        } else {
            self.refresh_snapshot_inventory(&token).await?;
            self.snapshots.collect(|state, entity| {
                Some(entity.to_csi(state == ResourceState::Created))
            })
        };

        let mut entries = entries;
        entries.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));

        let (entries, next_token) = paginate(entries, &req.starting_token, req.max_entries)?;
        Ok(ListSnapshotsResponse { entries, next_token })
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(CONTROLLER_CAPS.to_vec())
    }
}
