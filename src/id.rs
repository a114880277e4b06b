//! Volume and snapshot identifier codec.
//!
//! A volume is identified by the stable string
//! `/{type}/{appliance}/{pool}/{project}/{name}` where the type is `lun` for
//! block volumes and `mnt` for filesystems. A snapshot identifier appends one
//! more `/{snapshot}` segment. The legacy protocol-prefixed handle form
//! (`/nfs/...` and `/iscsi/...`, eight components) is accepted on parse.
//!
//! These are pure functions; the appliance is never consulted.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CsiError;

const VOLUME_MIN_COMPONENTS: usize = 2;
const VOLUME_ID_LEN: usize = 6;
const VOLUME_HANDLE_LEN: usize = 8;
const SNAPSHOT_ID_LEN: usize = 7;
const VOLUME_HREF_LEN: usize = 10;
const SNAPSHOT_HREF_LEN: usize = 12;

/// Maximum length of a pool, project, share, or snapshot name.
pub const RESOURCE_NAME_LENGTH: usize = 64;

static RESOURCE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_\-\.:]+$").unwrap_or_else(|e| panic!("resource name pattern: {e}"))
});

/// Whether `name` is acceptable as an appliance resource name component.
pub fn is_resource_name_valid(name: &str) -> bool {
    name.len() <= RESOURCE_NAME_LENGTH && RESOURCE_NAME_RE.is_match(name)
}

/// Volume kind, encoded as the leading identifier segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// iSCSI LUN, rendered `lun`.
    Block,
    /// NFS filesystem, rendered `mnt`.
    Mount,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "lun",
            Self::Mount => "mnt",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Volume identifiers
// ---------------------------------------------------------------------------

/// Fully qualified volume identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId {
    pub vtype: VolumeType,
    pub appliance: String,
    pub pool: String,
    pub project: String,
    pub name: String,
}

impl VolumeId {
    pub fn new(
        vtype: VolumeType,
        appliance: impl Into<String>,
        pool: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            vtype,
            appliance: appliance.into(),
            pool: pool.into(),
            project: project.into(),
            name: name.into(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.vtype == VolumeType::Block
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}",
            self.vtype, self.appliance, self.pool, self.project, self.name
        )
    }
}

impl FromStr for VolumeId {
    type Err = CsiError;

    /// Parses the canonical form and the legacy protocol-prefixed handle
    /// form. Name components are validated against the resource-name rules.
    fn from_str(s: &str) -> Result<Self, CsiError> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < VOLUME_MIN_COMPONENTS {
            return Err(CsiError::InvalidArgument(format!(
                "volume id ({s}) contains insufficient components ({VOLUME_MIN_COMPONENTS})"
            )));
        }

        let (vtype, pool, project, name) = match parts[1] {
            "nfs" | "iscsi" => {
                if parts.len() < VOLUME_HANDLE_LEN {
                    return Err(CsiError::NotFound(format!(
                        "volume handle ({s}) contains insufficient components ({VOLUME_HANDLE_LEN})"
                    )));
                }
                let vtype = if parts[1] == "iscsi" {
                    VolumeType::Block
                } else {
                    VolumeType::Mount
                };
                (vtype, parts[4], parts[6], parts[7])
            }
            "lun" | "mnt" => {
                if parts.len() < VOLUME_ID_LEN {
                    return Err(CsiError::NotFound(format!(
                        "volume id ({s}) contains insufficient components ({VOLUME_ID_LEN})"
                    )));
                }
                let vtype = if parts[1] == "lun" {
                    VolumeType::Block
                } else {
                    VolumeType::Mount
                };
                (vtype, parts[3], parts[4], parts[5])
            }
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "volume id ({s}) has unknown type prefix ({other})"
                )))
            }
        };

        if !is_resource_name_valid(pool) {
            return Err(CsiError::InvalidArgument(format!(
                "pool name is invalid ({pool})"
            )));
        }
        if !is_resource_name_valid(project) {
            return Err(CsiError::InvalidArgument(format!(
                "project name is invalid ({project})"
            )));
        }
        if !is_resource_name_valid(name) {
            return Err(CsiError::InvalidArgument(format!(
                "share name is invalid ({name})"
            )));
        }

        Ok(VolumeId::new(vtype, parts[2], pool, project, name))
    }
}

/// Derives the volume type encoded at href element 8.
fn vtype_from_href_segment(segment: &str, href: &str) -> Result<VolumeType, CsiError> {
    match segment {
        "filesystems" => Ok(VolumeType::Mount),
        "luns" => Ok(VolumeType::Block),
        _ => Err(CsiError::NotFound(format!("invalid href ({href})"))),
    }
}

/// Converts an appliance-native volume href
/// (`/api/storage/v2/pools/{p}/projects/{j}/{filesystems|luns}/{n}`) into the
/// canonical identifier string.
pub fn volume_id_string_from_href(appliance: &str, href: &str) -> Result<String, CsiError> {
    let parts: Vec<&str> = href.split('/').collect();
    if parts.len() < VOLUME_HREF_LEN {
        return Err(CsiError::NotFound(format!(
            "volume href ({href}) contains insufficient components ({VOLUME_HREF_LEN})"
        )));
    }
    let vtype = vtype_from_href_segment(parts[8], href)?;
    Ok(format!(
        "/{}/{}/{}/{}/{}",
        vtype, appliance, parts[5], parts[7], parts[9]
    ))
}

// ---------------------------------------------------------------------------
// Snapshot identifiers
// ---------------------------------------------------------------------------

/// Fully qualified snapshot identifier: the source volume id plus the
/// snapshot name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub volume_id: VolumeId,
    pub name: String,
}

impl SnapshotId {
    pub fn new(volume_id: VolumeId, name: impl Into<String>) -> Self {
        Self {
            volume_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume_id, self.name)
    }
}

impl FromStr for SnapshotId {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, CsiError> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() < SNAPSHOT_ID_LEN {
            return Err(CsiError::NotFound(format!(
                "snapshot id ({s}) contains insufficient components ({SNAPSHOT_ID_LEN})"
            )));
        }
        let volume_id: VolumeId = parts[..SNAPSHOT_ID_LEN - 1].join("/").parse()?;
        Ok(SnapshotId::new(volume_id, parts[6]))
    }
}

/// Parses an appliance-native snapshot href
/// (`.../{filesystems|luns}/{n}/snapshots/{s}`) into a typed snapshot id.
pub fn snapshot_id_from_href(appliance: &str, href: &str) -> Result<SnapshotId, CsiError> {
    let parts: Vec<&str> = href.split('/').collect();
    if parts.len() < SNAPSHOT_HREF_LEN {
        return Err(CsiError::NotFound(format!(
            "snapshot href ({href}) contains insufficient components ({SNAPSHOT_HREF_LEN})"
        )));
    }
    if parts[10] != "snapshots" {
        return Err(CsiError::NotFound(format!("invalid snapshot href ({href})")));
    }
    let vtype = vtype_from_href_segment(parts[8], href)?;
    Ok(SnapshotId::new(
        VolumeId::new(vtype, appliance, parts[5], parts[7], parts[9]),
        parts[11],
    ))
}

/// Converts an appliance-native snapshot href into the canonical snapshot
/// identifier string.
pub fn snapshot_id_string_from_href(appliance: &str, href: &str) -> Result<String, CsiError> {
    snapshot_id_from_href(appliance, href).map(|sid| sid.to_string())
}

// ---------------------------------------------------------------------------
// Appliance timestamps
// ---------------------------------------------------------------------------

/// Parses the appliance's `YYYY-MM-DDThh:mm:ss` date format into seconds
/// since the epoch, interpreted in local time.
pub fn date_to_unix(date: &str) -> Result<i64, CsiError> {
    let naive = NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| CsiError::InvalidArgument(format!("invalid date ({date}): {e}")))?;
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            Ok(dt.timestamp())
        }
        chrono::LocalResult::None => Err(CsiError::InvalidArgument(format!(
            "date ({date}) does not exist in the local timezone"
        ))),
    }
}
