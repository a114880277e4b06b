//! The volume entity held in the registry, shared by LUNs and filesystems.
//!
//! Both kinds expose one operation surface; the kind-specific attributes
//! live in a closed tagged variant so that a volume is always exactly one of
//! the two and populating it from an appliance record is a typed operation
//! per variant, never a runtime type switch.

use crate::id::VolumeId;
use crate::types::{AccessMode, AccessType, CapacityRange, VolumeCapability};
use crate::zfssa;

const KIB: i64 = 1024;
const MIB: i64 = KIB * 1024;
const GIB: i64 = MIB * 1024;

/// Capacity stamped on volumes whose request carries no usable range.
pub const DEFAULT_VOLUME_SIZE_BYTES: i64 = 50 * GIB;

/// Access modes accepted by NFS filesystems.
pub const FILESYSTEM_ACCESS_MODES: [AccessMode; 5] = [
    AccessMode::SingleNodeWriter,
    AccessMode::MultiNodeMultiWriter,
    AccessMode::MultiNodeSingleWriter,
    AccessMode::SingleNodeReaderOnly,
    AccessMode::MultiNodeReaderOnly,
];

/// Access modes accepted by read-only NFS filesystems.
pub const READONLY_FILESYSTEM_ACCESS_MODES: [AccessMode; 2] = [
    AccessMode::SingleNodeReaderOnly,
    AccessMode::MultiNodeReaderOnly,
];

/// Access modes accepted by block volumes.
pub const BLOCK_ACCESS_MODES: [AccessMode; 1] = [AccessMode::SingleNodeWriter];

/// Filesystem-specific attributes.
#[derive(Debug, Clone, Default)]
pub struct FilesystemAttrs {
    /// Server-relative export path, needed by node-side NFS mounts.
    pub mountpoint: String,
}

/// LUN-specific attributes.
#[derive(Debug, Clone, Default)]
pub struct LunAttrs {
    pub initiator_group: Vec<String>,
    pub target_group: String,
    /// LU number assigned by the appliance.
    pub assigned_number: Option<i32>,
}

/// Kind-specific half of a volume entity.
#[derive(Debug, Clone)]
pub enum VolumeKind {
    Filesystem(FilesystemAttrs),
    Lun(LunAttrs),
}

/// A volume as tracked by the registry.
#[derive(Debug, Clone)]
pub struct VolumeEntity {
    pub id: VolumeId,
    /// Appliance path of the resource; empty until populated.
    pub href: String,
    pub capacity: i64,
    /// Access modes the existing resource accepts.
    pub access_modes: Vec<AccessMode>,
    pub kind: VolumeKind,
}

impl VolumeEntity {
    pub fn new_filesystem(id: VolumeId) -> Self {
        Self {
            id,
            href: String::new(),
            capacity: 0,
            access_modes: Vec::new(),
            kind: VolumeKind::Filesystem(FilesystemAttrs::default()),
        }
    }

    pub fn new_lun(id: VolumeId) -> Self {
        Self {
            id,
            href: String::new(),
            capacity: 0,
            access_modes: Vec::new(),
            kind: VolumeKind::Lun(LunAttrs::default()),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, VolumeKind::Lun(_))
    }

    /// Loads an appliance filesystem record into the entity.
    pub fn set_filesystem_info(&mut self, info: &zfssa::Filesystem) {
        self.capacity = info.quota;
        self.href = info.href.clone();
        self.access_modes = if info.readonly {
            READONLY_FILESYSTEM_ACCESS_MODES.to_vec()
        } else {
            FILESYSTEM_ACCESS_MODES.to_vec()
        };
        self.kind = VolumeKind::Filesystem(FilesystemAttrs {
            mountpoint: info.mountpoint.clone(),
        });
    }

    /// Loads an appliance LUN record into the entity.
    pub fn set_lun_info(&mut self, info: &zfssa::Lun) {
        self.capacity = info.volume_size as i64;
        self.href = info.href.clone();
        self.access_modes = BLOCK_ACCESS_MODES.to_vec();
        self.kind = VolumeKind::Lun(LunAttrs {
            initiator_group: info.initiator_group.clone(),
            target_group: info.target_group.clone(),
            assigned_number: info.assigned_number.first().copied(),
        });
    }

    /// Export path, when this is a populated filesystem.
    pub fn mountpoint(&self) -> Option<&str> {
        match &self.kind {
            VolumeKind::Filesystem(fs) if !fs.mountpoint.is_empty() => Some(&fs.mountpoint),
            _ => None,
        }
    }
}

/// Whether every requested capability is a block capability.
pub fn is_block_request(capabilities: &[VolumeCapability]) -> bool {
    capabilities
        .iter()
        .all(|cap| cap.access_type == AccessType::Block)
}

/// Resolves the requested capacity: `required_bytes` when positive, else
/// `limit_bytes` when positive and below the default, else the default.
pub fn volume_size(range: Option<&CapacityRange>) -> i64 {
    match range {
        Some(range) if range.required_bytes > 0 => range.required_bytes,
        Some(range) if range.limit_bytes > 0 && range.limit_bytes < DEFAULT_VOLUME_SIZE_BYTES => {
            range.limit_bytes
        }
        _ => DEFAULT_VOLUME_SIZE_BYTES,
    }
}

/// Whether an existing resource of `capacity` bytes satisfies the request's
/// capacity range. Zero-valued bounds are unconstrained.
pub fn compare_capacity_range(range: Option<&CapacityRange>, capacity: i64) -> bool {
    let Some(range) = range else {
        return true;
    };
    if range.limit_bytes != 0 && range.limit_bytes < capacity {
        return false;
    }
    if range.required_bytes != 0 && range.required_bytes > capacity {
        return false;
    }
    true
}

/// Whether every requested capability is covered by the resource's accepted
/// access modes, with matching block/mount access type.
pub fn compare_capabilities(
    requested: &[VolumeCapability],
    accepted: &[AccessMode],
    block: bool,
) -> bool {
    requested.iter().all(|cap| {
        let type_matches = (cap.access_type == AccessType::Block) == block;
        type_matches && accepted.contains(&cap.access_mode)
    })
}

/// Whether all capabilities are valid for a filesystem volume.
pub fn are_filesystem_caps_valid(capabilities: &[VolumeCapability]) -> bool {
    capabilities
        .iter()
        .all(|cap| FILESYSTEM_ACCESS_MODES.contains(&cap.access_mode))
}

/// Whether all capabilities are valid for a block volume.
pub fn are_block_caps_valid(capabilities: &[VolumeCapability]) -> bool {
    capabilities
        .iter()
        .all(|cap| BLOCK_ACCESS_MODES.contains(&cap.access_mode))
}
