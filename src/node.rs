//! CSI Node service trait.
//!
//! The Node service runs on each worker node and performs the local
//! operations that make a published volume usable by containers:
//!
//! 1. **Stage** — per-volume node preparation (a no-op for this driver).
//! 2. **Publish** — attach the iSCSI LUN and bind-mount its block device,
//!    or mount the NFS share, at the target path.
//! 3. **Unpublish** — unmount and, for the last block reference, tear down
//!    the iSCSI session.
//! 4. **Unstage** — unmount the staging path.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeGetInfoResponse, NodePublishVolumeRequest, NodeStageVolumeRequest,
    NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};

/// Node service — local attach / mount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume. Idempotent.
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume. Idempotent: an unstaged path succeeds.
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError>;

    /// Publish a volume at the target path. Idempotent.
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from the target path. Idempotent.
    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest)
        -> Result<(), CsiError>;

    /// Return this node's identity.
    async fn node_get_info(&self) -> Result<NodeGetInfoResponse, CsiError>;

    /// Advertise the node capabilities.
    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
