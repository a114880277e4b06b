//! Snapshot entities and their create / delete state machine.

use tracing::debug;

use crate::error::CsiError;
use crate::id::{date_to_unix, SnapshotId};
use crate::registry::ResourceState;
use crate::types::{CreateSnapshotResponse, Snapshot};
use crate::zfssa;
use crate::zfssa::token::Token;

use super::{SnapshotHandle, ZfssaDriver};

/// A snapshot as tracked by the registry.
#[derive(Debug, Clone)]
pub struct SnapshotEntity {
    pub id: SnapshotId,
    /// Appliance path of the snapshot; empty until populated.
    pub href: String,
    /// Number of clones depending on this snapshot.
    pub num_clones: i64,
    /// Bytes unique to this snapshot.
    pub space_unique: i64,
    /// Bytes of referenced data.
    pub space_data: i64,
    /// Creation time, seconds since the epoch.
    pub created_at: i64,
}

impl SnapshotEntity {
    pub fn new(id: SnapshotId) -> Self {
        Self {
            id,
            href: String::new(),
            num_clones: 0,
            space_unique: 0,
            space_data: 0,
            created_at: 0,
        }
    }

    /// Loads an appliance snapshot record into the entity. Fails when the
    /// appliance's creation date cannot be parsed.
    pub fn set_info(&mut self, info: &zfssa::Snapshot) -> Result<(), CsiError> {
        self.created_at = date_to_unix(&info.creation_time)?;
        self.num_clones = info.num_clones;
        self.space_unique = info.space_unique;
        self.space_data = info.space_data;
        self.href = info.href.clone();
        Ok(())
    }

    /// The CSI-facing view of this snapshot.
    pub fn to_csi(&self, ready: bool) -> Snapshot {
        Snapshot {
            snapshot_id: self.id.to_string(),
            source_volume_id: self.id.volume_id.to_string(),
            size_bytes: self.space_data,
            creation_time: self.created_at,
            ready_to_use: ready,
        }
    }
}

impl ZfssaDriver {
    /// Creates the snapshot on the appliance. A 409 means a same-named
    /// snapshot of this volume already exists; an already-populated entity
    /// refreshes from the appliance and the create succeeds idempotently.
    pub(crate) async fn create_snapshot_on_appliance(
        &self,
        token: &Token,
        handle: &SnapshotHandle,
    ) -> Result<CreateSnapshotResponse, CsiError> {
        let volume_href = handle.volume().data().href.clone();
        let name = handle.data().id.name.clone();

        if handle.state() == ResourceState::Created {
            // The snapshot is already known; refresh and answer.
            let info = self.client.get_snapshot(token, &volume_href, &name).await?;
            handle.data_mut().set_info(&info)?;
            return Ok(CreateSnapshotResponse {
                snapshot: handle.data().to_csi(true),
            });
        }

        match self.client.create_snapshot(token, &volume_href, &name).await {
            Ok(info) => {
                if let Err(e) = handle.data_mut().set_info(&info) {
                    handle.set_state(ResourceState::Deleted);
                    return Err(e);
                }
                handle.set_state(ResourceState::Created);
            }
            Err(e) if e.appliance_status() == Some(409) => {
                debug!(snapshot = %name, "snapshot already exists on the appliance");
                let info = self.client.get_snapshot(token, &volume_href, &name).await?;
                if let Err(e) = handle.data_mut().set_info(&info) {
                    handle.set_state(ResourceState::Deleted);
                    return Err(e);
                }
                handle.set_state(ResourceState::Created);
            }
            Err(e) => {
                handle.set_state(ResourceState::Deleted);
                return Err(e);
            }
        }

        Ok(CreateSnapshotResponse {
            snapshot: handle.data().to_csi(true),
        })
    }

    /// Deletes the snapshot on the appliance. The dependent-clone count is
    /// refreshed first; any positive count refuses the delete. A 404 at any
    /// point is success.
    pub(crate) async fn delete_snapshot_on_appliance(
        &self,
        token: &Token,
        handle: &SnapshotHandle,
    ) -> Result<(), CsiError> {
        let volume_href = handle.volume().data().href.clone();
        let name = handle.data().id.name.clone();

        match self.client.get_snapshot(token, &volume_href, &name).await {
            Ok(info) => {
                handle.data_mut().set_info(&info)?;
            }
            Err(e) if e.is_not_found() => {
                handle.set_state(ResourceState::Deleted);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let (num_clones, href) = {
            let data = handle.data();
            (data.num_clones, data.href.clone())
        };
        if num_clones > 0 {
            let dependents = self.client.get_snapshot_dependents(token, &href).await?;
            let shares: Vec<&str> = dependents.iter().map(|d| d.share.as_str()).collect();
            return Err(CsiError::FailedPrecondition(format!(
                "snapshot has ({num_clones}) dependents {shares:?}"
            )));
        }

        match self.client.delete_snapshot(token, &href).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        handle.set_state(ResourceState::Deleted);
        Ok(())
    }
}
