//! Filesystem volume operations: create with conflict reconciliation,
//! clone, delete, and expansion.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::CsiError;
use crate::registry::ResourceState;
use crate::types::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, CreateVolumeRequest,
    CreateVolumeResponse, Volume,
};
use crate::zfssa::token::Token;

use super::volume::{compare_capabilities, compare_capacity_range, volume_size};
use super::{SnapshotHandle, VolumeHandle, ZfssaDriver};

impl ZfssaDriver {
    /// Creates the filesystem on the appliance, reconciling a 409 against
    /// the existing share.
    pub(crate) async fn create_filesystem_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
        req: &CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let mut parameters = req.parameters.clone();
        // Share defaults the orchestrator usually leaves unset.
        parameters
            .entry("restrictChown".to_owned())
            .or_insert_with(|| "false".to_owned());
        parameters
            .entry("shareNFS".to_owned())
            .or_insert_with(|| "on".to_owned());

        let size = volume_size(req.capacity_range.as_ref());

        if handle.state() == ResourceState::Created {
            // The share is already known to this driver; reconcile without
            // re-posting.
            return self.reconcile_existing_filesystem(handle, req, parameters).await;
        }

        match self
            .client
            .create_filesystem(token, &req.name, size, &parameters)
            .await
        {
            Ok(info) => {
                handle.data_mut().set_filesystem_info(&info);
                handle.set_state(ResourceState::Created);
            }
            Err(e) if e.appliance_status() == Some(409) => {
                debug!(name = %req.name, "filesystem already exists on the appliance");
                return self.reconcile_existing_filesystem(handle, req, parameters).await;
            }
            Err(e) => {
                handle.set_state(ResourceState::Deleted);
                return Err(e);
            }
        }

        let mut context = parameters;
        if let Some(mountpoint) = handle.data().mountpoint() {
            // Node-publish needs the export path.
            context.insert("mountpoint".to_owned(), mountpoint.to_owned());
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: handle.data().id.to_string(),
                capacity_bytes: handle.data().capacity,
                volume_context: context,
                content_source: None,
            },
        })
    }

    /// Checks an existing share against the request: the capacity must
    /// satisfy the requested range and the requested access modes must be a
    /// subset of the share's accepted set. Compatible means idempotent
    /// success.
    async fn reconcile_existing_filesystem(
        &self,
        handle: &VolumeHandle,
        req: &CreateVolumeRequest,
        mut context: std::collections::HashMap<String, String>,
    ) -> Result<CreateVolumeResponse, CsiError> {
        let (id, capacity, access_modes, mountpoint) = {
            let data = handle.data();
            (
                data.id.clone(),
                data.capacity,
                data.access_modes.clone(),
                data.mountpoint().map(str::to_owned),
            )
        };

        if !compare_capacity_range(req.capacity_range.as_ref(), capacity) {
            let range = req.capacity_range.unwrap_or_default();
            return Err(CsiError::AlreadyExists(format!(
                "volume ({}) is already on target ({}), capacity range incompatible ({}), requested ({}/{})",
                id.name, id.appliance, capacity, range.required_bytes, range.limit_bytes
            )));
        }
        if !compare_capabilities(&req.volume_capabilities, &access_modes, false) {
            return Err(CsiError::AlreadyExists(format!(
                "volume ({}) is already on target ({}), access modes are incompatible",
                id.name, id.appliance
            )));
        }

        if let Some(mountpoint) = mountpoint {
            context.insert("mountpoint".to_owned(), mountpoint);
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: id.to_string(),
                capacity_bytes: capacity,
                volume_context: context,
                content_source: None,
            },
        })
    }

    /// Clones a snapshot into a new share.
    pub(crate) async fn clone_filesystem_volume(
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

        let snapshot_href = snapshot.data().href.clone();
        let info = self
            .client
            .clone_filesystem_snapshot(token, &snapshot_href, &parameters)
            .await?;
        handle.data_mut().set_filesystem_info(&info);
        handle.set_state(ResourceState::Created);

        let mut context = req.parameters.clone();
        if let Some(mountpoint) = handle.data().mountpoint() {
            context.insert("mountpoint".to_owned(), mountpoint.to_owned());
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: handle.data().id.to_string(),
                capacity_bytes: handle.data().capacity,
                volume_context: context,
                content_source: req.content_source.clone(),
            },
        })
    }

    /// Deletes the share. A 404 at delete time is success.
    pub(crate) async fn delete_filesystem_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
    ) -> Result<(), CsiError> {
        if handle.state() == ResourceState::Created {
            let href = handle.data().href.clone();
            match self.client.delete_filesystem(token, &href).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            handle.set_state(ResourceState::Deleted);
        }
        Ok(())
    }

    /// Expands the share by rewriting its quota and reservation. A share
    /// already at or above the requested size is left untouched.
    pub(crate) async fn expand_filesystem_volume(
        &self,
        token: &Token,
        handle: &VolumeHandle,
        req: &ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        let requested = req.capacity_range.required_bytes;
        let (capacity, href) = {
            let data = handle.data();
            (data.capacity, data.href.clone())
        };
        if capacity >= requested {
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: capacity,
                node_expansion_required: false,
            });
        }

        let mut properties = Map::new();
        properties.insert("quota".to_owned(), Value::from(requested));
        properties.insert("reservation".to_owned(), Value::from(requested));
        let info = self
            .client
            .modify_filesystem(token, &href, &properties)
            .await?;
        handle.data_mut().capacity = info.quota;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: info.quota,
            node_expansion_required: false,
        })
    }
}
