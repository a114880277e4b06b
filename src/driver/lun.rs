//! Block volume operations: create with conflict reconciliation, clone,
//! delete, and the initiator-group publish protocol.
//!
//! Publication state is not tracked locally: it lives on the appliance as
//! the LUN's initiator-group list. The driver creates every LUN masked
//! (`MASK_ALL`), swaps the mask for a node-named initiator group on publish,
//! and restores the mask on unpublish. A LUN whose list is anything but
//! exactly the mask was published by somebody else and is never touched.

use serde_json::{json, Map};
use tracing::{debug, warn};

use crate::error::CsiError;
use crate::registry::ResourceState;
use crate::types::{CreateVolumeRequest, CreateVolumeResponse, Volume};
use crate::zfssa::token::Token;
use crate::zfssa::MASK_ALL;

use super::volume::{compare_capabilities, compare_capacity_range, volume_size};
use super::{SnapshotHandle, VolumeHandle, ZfssaDriver};

impl ZfssaDriver {
    /// Creates the LUN on the appliance, reconciling a 409 against the
    /// existing LUN.
    pub(crate) async fn create_lun_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
        req: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let size = volume_size(req.capacity_range.as_ref());

        if handle.state() == ResourceState::Created {
            return self.reconcile_existing_lun(handle, req);
        }

        match self.client.create_lun(token, &req.name, size, &req.parameters).await {
            Ok(info) => {
                debug!(
                    name = %info.canonical_name,
                    target_group = %info.target_group,
                    assigned_number = ?info.assigned_number.first(),
                    "lun created"
                );
                handle.data_mut().set_lun_info(&info);
                handle.set_state(ResourceState::Created);
            }
            Err(e) if e.appliance_status() == Some(409) => {
                debug!(name = %req.name, "lun already exists on the appliance");
                return self.reconcile_existing_lun(handle, req);
            }
            Err(e) => {
                handle.set_state(ResourceState::Deleted);
                return Err(e);
            }
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: handle.data().id.to_string(),
                capacity_bytes: handle.data().capacity,
                volume_context: req.parameters.clone(),
                content_source: None,
            },
        })
    }

    /// Checks an existing LUN against the request, exactly as for
    /// filesystems but with the block access-mode set.
    fn reconcile_existing_lun(
        &self,
        handle: &VolumeHandle,
        req: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let (id, capacity, access_modes) = {
            let data = handle.data();
            (data.id.clone(), data.capacity, data.access_modes.clone())
        };

        if !compare_capacity_range(req.capacity_range.as_ref(), capacity) {
            let range = req.capacity_range.unwrap_or_default();
            return Err(CsiError::AlreadyExists(format!(
                "volume ({}) is already on target ({}), capacity range incompatible ({}), requested ({}/{})",
                id.name, id.appliance, capacity, range.required_bytes, range.limit_bytes
            )));
        }
        if !compare_capabilities(&req.volume_capabilities, &access_modes, true) {
            return Err(CsiError::AlreadyExists(format!(
                "volume ({}) is already on target ({}), access modes are incompatible",
                id.name, id.appliance
            )));
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: id.to_string(),
                capacity_bytes: capacity,
                volume_context: req.parameters.clone(),
                content_source: None,
            },
        })
    }

    /// Clones a snapshot into a new LUN. The clone is born masked, like
    /// every LUN this driver creates.
    pub(crate) async fn clone_lun_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
        req: &CreateVolumeRequest,
        snapshot: &SnapshotHandle,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let mut parameters = Map::new();
        parameters.insert(
            "project".to_owned(),
            json!(req.parameters.get("project").cloned().unwrap_or_default()),
        );
        parameters.insert("share".to_owned(), json!(req.name));
        parameters.insert("initiatorgroup".to_owned(), json!([MASK_ALL]));

        let snapshot_href = snapshot.data().href.clone();
        let info = self
            .client
            .clone_lun_snapshot(token, &snapshot_href, &parameters)
            .await?;
        handle.data_mut().set_lun_info(&info);
        handle.set_state(ResourceState::Created);

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: handle.data().id.to_string(),
                capacity_bytes: handle.data().capacity,
                volume_context: req.parameters.clone(),
                content_source: req.content_source.clone(),
            },
        })
    }

    /// Deletes the LUN. A 404 at delete time is success.
    pub(crate) async fn delete_lun_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
    ) -> Result<(), CsiError> {
        if handle.state() == ResourceState::Created {
            let id = handle.data().id.clone();
            match self
                .client
                .delete_lun(token, &id.pool, &id.project, &id.name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            handle.set_state(ResourceState::Deleted);
        }
        Ok(())
    }

    /// Publishes the LUN to a node by swapping the mask for an initiator
    /// group named after the node. Appliance administrators provision
    /// per-node initiator groups mapping node names to IQNs.
    ///
    /// The current list must be exactly `[MASK_ALL]`: zero entries, several
    /// entries, or a single foreign entry all mean the LUN is not in this
    /// driver's unpublished state and must not be hijacked.
    pub(crate) async fn publish_lun_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
        node_name: &str,
    ) -> Result<(), CsiError> {
        let id = handle.data().id.clone();

        let groups = self
            .client
            .get_initiator_group_list(token, &id.pool, &id.project, &id.name)
            .await?;

        debug!(volume = %id, groups = ?groups, "initiator groups before publish");
        if groups.len() != 1 || groups[0] != MASK_ALL {
            let message = if groups.is_empty() {
                format!("volume ({id}) did not return an initiator group list")
            } else {
                format!("volume ({id}:{}) may already be published", groups[0])
            };
            return Err(CsiError::FailedPrecondition(message));
        }

        self.client
            .set_initiator_group_list(token, &id.pool, &id.project, &id.name, node_name)
            .await?;
        Ok(())
    }

    /// Unpublishes the LUN by restoring the mask. A 404 means the LUN was
    /// already deleted; that counts as unpublished.
    pub(crate) async fn unpublish_lun_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
    ) -> Result<(), CsiError> {
        let id = handle.data().id.clone();
        match self
            .client
            .set_initiator_group_list(token, &id.pool, &id.project, &id.name, MASK_ALL)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(volume = %id, "unpublish found the lun deleted, reporting success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
