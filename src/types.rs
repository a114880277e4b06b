//! Core CSI types: capabilities, volumes, snapshots, and the request and
//! response shapes of the three services.
//!
//! These types form the data model shared by the service traits, the
//! transport layer, and the appliance-backed driver. They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Access modes & capabilities
// ---------------------------------------------------------------------------

/// How a volume may be attached and written across nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Read-write on one node, read-only on the others.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

/// Whether a volume is consumed as a raw block device or a mounted
/// filesystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Mounted filesystem (NFS share).
    Mount,
    /// Raw block device (iSCSI LUN).
    Block,
}

/// A single requested capability: access type plus access mode, with the
/// mount-specific extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
    /// Filesystem type for mount capabilities (e.g. `"nfs"`).
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl VolumeCapability {
    /// Convenience constructor for a block capability.
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Block,
            access_mode,
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }

    /// Convenience constructor for a mount capability.
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Mount,
            access_mode,
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// Capacity constraints of a create or expand request, in bytes. A zero
/// bound is unconstrained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// Pre-populated content for a new volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeContentSource {
    /// Snapshot to clone from.
    pub snapshot_id: String,
}

/// Metadata of a provisioned volume as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Canonical volume identifier, e.g. `/lun/zs1/pool/proj/vol`.
    pub volume_id: String,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: i64,
    /// Opaque context forwarded to node operations. Echoes the create
    /// parameters, augmented with `mountpoint` for filesystems.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Set when the volume was cloned from a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_source: Option<VolumeContentSource>,
}

/// Metadata of a snapshot as reported to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Canonical snapshot identifier, e.g. `/lun/zs1/pool/proj/vol/snap`.
    pub snapshot_id: String,
    /// Identifier of the snapshotted volume.
    pub source_volume_id: String,
    /// Referenced data bytes.
    pub size_bytes: i64,
    /// Creation time, seconds since the epoch.
    pub creation_time: i64,
    pub ready_to_use: bool,
}

// ---------------------------------------------------------------------------
// Controller requests & responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters (`pool`, `project`, `targetGroup`, ...).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    /// Node the volume is published to; must name an appliance initiator
    /// group for block volumes.
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeResponse {
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// True when every requested capability is supported.
    pub confirmed: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// 0 means unlimited; negative is rejected.
    #[serde(default)]
    pub max_entries: i32,
    /// Decimal index of the first entry; empty means 0.
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    /// `"0"` at end of stream, otherwise the next starting index.
    pub next_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityResponse {
    pub available_capacity: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    pub capacity_range: CapacityRange,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    /// When set, return exactly this snapshot (silently empty on miss).
    #[serde(default)]
    pub snapshot_id: String,
    /// When set, restrict the listing to this volume's snapshots.
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub entries: Vec<Snapshot>,
    pub next_token: String,
}

// ---------------------------------------------------------------------------
// Node requests & responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub staging_target_path: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
}

// ---------------------------------------------------------------------------
// Plugin & capability advertisement
// ---------------------------------------------------------------------------

/// Information about the plugin itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

/// Plugin-level capabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// The plugin runs a Controller service.
    ControllerService,
    /// Volumes may be expanded while published.
    OnlineVolumeExpansion,
}

/// Controller-service capabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    ExpandVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
}

/// Node-service capabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}
