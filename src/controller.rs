//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle:
//! creation, deletion, publication to nodes, capability validation, listing,
//! capacity queries, expansion, and the snapshot lifecycle. Every operation
//! is idempotent: the orchestrator may lose state and repeat any call.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::*;

/// Controller service — centralized volume and snapshot management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one when an identical
    /// request was already satisfied.
    async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, CsiError>;

    /// Delete a volume. Deleting an unknown volume succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Make a volume reachable from a node. For block volumes this rewrites
    /// the LUN's initiator group; a LUN whose masking reveals foreign
    /// ownership is refused.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, CsiError>;

    /// Revoke a volume's reachability. Unpublishing an unknown volume
    /// succeeds.
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// List the volumes on the appliance, paginated.
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError>;

    /// Report available capacity for a project, a pool, or the whole
    /// appliance.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, CsiError>;

    /// Grow a volume. Only filesystems support expansion.
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;

    /// Take a snapshot of a volume.
    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, CsiError>;

    /// Delete a snapshot. Deleting an unknown snapshot succeeds; a snapshot
    /// with dependent clones is refused.
    async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<(), CsiError>;

    /// List snapshots, paginated, optionally restricted to one snapshot or
    /// one source volume.
    async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, CsiError>;

    /// Advertise the controller capabilities.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
