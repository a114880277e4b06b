//! Protocol messages exchanged over the UNIX-socket transport.
//!
//! [`CsiMessage`] is the top-level envelope for all request and response
//! variants exchanged between the orchestrator-facing client and the driver.
//! Each connection carries exactly one request followed by one response.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests ----------------------------------------------
    /// Health probe.
    Probe,
    /// Query plugin info.
    GetPluginInfo,
    /// Query plugin capabilities.
    GetPluginCapabilities,

    // ----- Controller requests --------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity(GetCapacityRequest),
    ControllerExpandVolume(ControllerExpandVolumeRequest),
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(DeleteSnapshotRequest),
    ListSnapshots(ListSnapshotsRequest),
    ControllerGetCapabilities,

    // ----- Node requests ---------------------------------------------------
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeGetInfo,
    NodeGetCapabilities,

    // ----- Responses -------------------------------------------------------
    ProbeResult(bool),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    VolumeCreated(CreateVolumeResponse),
    VolumePublished(ControllerPublishVolumeResponse),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    VolumeList(ListVolumesResponse),
    Capacity(GetCapacityResponse),
    VolumeExpanded(ControllerExpandVolumeResponse),
    SnapshotCreated(CreateSnapshotResponse),
    SnapshotList(ListSnapshotsResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    NodeInfoResponse(NodeGetInfoResponse),
    NodeCapabilities(Vec<NodeCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ControllerPublishVolume(req) => {
                write!(f, "ControllerPublishVolume({} -> {})", req.volume_id, req.node_id)
            }
            Self::ControllerUnpublishVolume(req) => {
                write!(f, "ControllerUnpublishVolume({})", req.volume_id)
            }
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ListVolumes(_) => f.write_str("ListVolumes"),
            Self::GetCapacity(_) => f.write_str("GetCapacity"),
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::CreateSnapshot(req) => write!(f, "CreateSnapshot(name={})", req.name),
            Self::DeleteSnapshot(req) => write!(f, "DeleteSnapshot({})", req.snapshot_id),
            Self::ListSnapshots(_) => f.write_str("ListSnapshots"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume(req) => write!(f, "NodeUnstageVolume({})", req.volume_id),
            Self::NodePublishVolume(req) => write!(f, "NodePublishVolume({})", req.volume_id),
            Self::NodeUnpublishVolume(req) => {
                write!(f, "NodeUnpublishVolume({})", req.volume_id)
            }
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::ProbeResult(ready) => write!(f, "ProbeResult({ready})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::VolumeCreated(rsp) => write!(f, "VolumeCreated({})", rsp.volume.volume_id),
            Self::VolumePublished(_) => f.write_str("VolumePublished"),
            Self::CapabilitiesValidated(rsp) => {
                write!(f, "CapabilitiesValidated(confirmed={})", rsp.confirmed)
            }
            Self::VolumeList(rsp) => write!(f, "VolumeList(count={})", rsp.entries.len()),
            Self::Capacity(rsp) => write!(f, "Capacity({})", rsp.available_capacity),
            Self::VolumeExpanded(rsp) => write!(f, "VolumeExpanded({})", rsp.capacity_bytes),
            Self::SnapshotCreated(rsp) => {
                write!(f, "SnapshotCreated({})", rsp.snapshot.snapshot_id)
            }
            Self::SnapshotList(rsp) => write!(f, "SnapshotList(count={})", rsp.entries.len()),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
