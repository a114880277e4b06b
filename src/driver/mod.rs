//! The appliance-backed driver.
//!
//! [`ZfssaDriver`] implements the three CSI service traits against a ZFS
//! Storage Appliance. It owns the REST client, the two exclusive-access
//! registries (volumes and snapshots), and the node-side collaborators
//! (mounter, iSCSI session management).
//!
//! # Resource access control
//!
//! The CSI specification allows the orchestrator to lose state and issue
//! simultaneous calls for the same volume. Every mutation therefore goes
//! through [`ZfssaDriver::new_volume`] or [`ZfssaDriver::lookup_volume`]
//! (and the snapshot equivalents), which return a handle granting exclusive
//! access until dropped. A snapshot handle also holds its source volume's
//! handle, and always acquires and releases the two in volume-then-snapshot
//! order, which is the crate's only cross-resource lock ordering.

pub mod controller;
pub mod filesystem;
pub mod identity;
pub mod iscsi;
pub mod lun;
pub mod mount;
pub mod node;
pub mod snapshot;
pub mod volume;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::config::{read_credentials, Config};
use crate::error::CsiError;
use crate::id::{SnapshotId, VolumeId, VolumeType};
use crate::registry::{Handle, Registry, ResourceState};
use crate::zfssa::token::Token;
use crate::zfssa::ZfssaClient;

use iscsi::{IscsiAdm, IscsiSession};
use mount::{Mounter, NodeMounter};
use snapshot::SnapshotEntity;
use volume::VolumeEntity;

/// Exclusive access to one volume.
pub type VolumeHandle = Handle<VolumeEntity>;

/// Exclusive access to one snapshot and, transitively, its source volume.
///
/// The snapshot latch is declared first so it is released strictly before
/// the source volume's latch.
pub struct SnapshotHandle {
    snap: Handle<SnapshotEntity>,
    volume: VolumeHandle,
}

impl SnapshotHandle {
    pub fn name(&self) -> &str {
        self.snap.name()
    }

    pub fn state(&self) -> ResourceState {
        self.snap.state()
    }

    pub fn set_state(&self, state: ResourceState) {
        self.snap.set_state(state);
    }

    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, SnapshotEntity> {
        self.snap.data()
    }

    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, SnapshotEntity> {
        self.snap.data_mut()
    }

    /// The latched source volume.
    pub fn volume(&self) -> &VolumeHandle {
        &self.volume
    }
}

/// The CSI driver instance.
pub struct ZfssaDriver {
    name: String,
    version: String,
    config: Config,
    client: Arc<ZfssaClient>,
    volumes: Registry<VolumeEntity>,
    snapshots: Registry<SnapshotEntity>,
    mounter: Arc<dyn Mounter>,
    iscsi: Arc<dyn IscsiSession>,
}

impl ZfssaDriver {
    /// Builds a driver from the runtime configuration, with the production
    /// collaborators (TLS REST client, kernel mounter, iscsiadm).
    pub fn new(driver_name: &str, version: &str, config: Config) -> Result<Self, CsiError> {
        let client = ZfssaClient::new(
            &config.appliance,
            config.certificate.as_deref(),
            config.secure,
        )?;
        Ok(Self::assemble(
            driver_name,
            version,
            config,
            client,
            Arc::new(NodeMounter::new()),
            Arc::new(IscsiAdm::new()),
        ))
    }

    /// Builds a driver around an existing client, with the production node
    /// collaborators. Intended for exercising the control plane against a
    /// stand-in appliance.
    pub fn with_client(
        driver_name: &str,
        version: &str,
        config: Config,
        client: ZfssaClient,
    ) -> Self {
        Self::assemble(
            driver_name,
            version,
            config,
            client,
            Arc::new(NodeMounter::new()),
            Arc::new(IscsiAdm::new()),
        )
    }

    /// Builds a driver with every collaborator supplied by the caller.
    pub fn with_collaborators(
        driver_name: &str,
        version: &str,
        config: Config,
        client: ZfssaClient,
        mounter: Arc<dyn Mounter>,
        iscsi: Arc<dyn IscsiSession>,
    ) -> Self {
        Self::assemble(driver_name, version, config, client, mounter, iscsi)
    }

    fn assemble(
        driver_name: &str,
        version: &str,
        config: Config,
        client: ZfssaClient,
        mounter: Arc<dyn Mounter>,
        iscsi: Arc<dyn IscsiSession>,
    ) -> Self {
        Self {
            name: driver_name.to_owned(),
            version: version.to_owned(),
            config,
            client: Arc::new(client),
            volumes: Registry::new(),
            snapshots: Registry::new(),
            mounter,
            iscsi,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -- Credentials --------------------------------------------------------

    /// Resolves the appliance login for one RPC. A request's secrets map
    /// takes precedence; otherwise the credentials file is re-read so
    /// rotated secrets take effect without a restart.
    pub(crate) fn login(&self, secrets: &HashMap<String, String>) -> Result<Arc<Token>, CsiError> {
        if let Some(user) = secrets.get("username") {
            let password = secrets.get("password").cloned().unwrap_or_default();
            return Ok(self.client.token(user, &password));
        }
        let creds = read_credentials(&self.config.cred_path)
            .map_err(|e| CsiError::Unauthenticated(format!("invalid credentials: {e}")))?;
        Ok(self.client.token(&creds.username, &creds.password))
    }

    // -- Volume access ------------------------------------------------------

    /// Returns an exclusively held volume, registering a fresh entity in
    /// `Creating` when the name is unknown. An entity held by another
    /// request surfaces *aborted: busy*.
    pub(crate) async fn new_volume(
        &self,
        pool: &str,
        project: &str,
        name: &str,
        block: bool,
    ) -> Result<VolumeHandle, CsiError> {
        let vtype = if block {
            VolumeType::Block
        } else {
            VolumeType::Mount
        };
        let id = VolumeId::new(vtype, &self.config.appliance, pool, project, name);
        self.volumes
            .acquire(name, move || {
                if block {
                    VolumeEntity::new_lun(id)
                } else {
                    VolumeEntity::new_filesystem(id)
                }
            })
            .await
    }

    /// Returns an exclusively held volume for an id arriving in a request.
    /// Unknown names are fetched from the appliance; a miss there is
    /// *not-found*.
    pub(crate) async fn lookup_volume(
        &self,
        token: &Token,
        volume_id: &str,
    ) -> Result<VolumeHandle, CsiError> {
        let vid = VolumeId::from_str(volume_id)?;

        if let Some(cached) = self.volumes.acquire_if_cached(&vid.name).await {
            return cached;
        }

        let handle = self
            .new_volume(&vid.pool, &vid.project, &vid.name, vid.is_block())
            .await?;
        match handle.state() {
            ResourceState::Creating => {
                // Fresh entity: ask the appliance.
                let populated = if vid.is_block() {
                    self.client
                        .get_lun(token, &vid.pool, &vid.project, &vid.name)
                        .await
                        .map(|info| handle.data_mut().set_lun_info(&info))
                } else {
                    self.client
                        .get_filesystem(token, &vid.pool, &vid.project, &vid.name)
                        .await
                        .map(|info| handle.data_mut().set_filesystem_info(&info))
                };
                match populated {
                    Ok(()) => {
                        handle.set_state(ResourceState::Created);
                        Ok(handle)
                    }
                    Err(e) => {
                        drop(handle);
                        if e.is_not_found() {
                            Err(CsiError::NotFound(format!("volume ({volume_id}) not found")))
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            // Another request populated it while we were acquiring.
            ResourceState::Created => Ok(handle),
            ResourceState::Deleted => {
                drop(handle);
                Err(CsiError::NotFound(format!("volume ({volume_id}) not found")))
            }
        }
    }

    // -- Snapshot access ----------------------------------------------------

    /// Returns an exclusively held snapshot, registering a fresh entity when
    /// the name is unknown. The source volume is latched first and stays
    /// latched for as long as the snapshot handle lives.
    pub(crate) async fn new_snapshot(
        &self,
        token: &Token,
        name: &str,
        source_id: &str,
    ) -> Result<SnapshotHandle, CsiError> {
        let volume = self.lookup_volume(token, source_id).await?;
        let sid = SnapshotId::new(volume.data().id.clone(), name);

        let snap = self
            .snapshots
            .acquire(name, {
                let sid = sid.clone();
                move || SnapshotEntity::new(sid)
            })
            .await?;

        if snap.data().id.volume_id != sid.volume_id {
            debug!(snapshot = name, "snapshot exists with a different source");
            return Err(CsiError::AlreadyExists(format!(
                "snapshot ({name}) already exists with a different source"
            )));
        }

        Ok(SnapshotHandle { snap, volume })
    }

    /// Returns an exclusively held snapshot for an id arriving in a request.
    /// Unknown names are fetched from the appliance; a miss there is
    /// *not-found*.
    pub(crate) async fn lookup_snapshot(
        &self,
        token: &Token,
        snapshot_id: &str,
    ) -> Result<SnapshotHandle, CsiError> {
        let sid = SnapshotId::from_str(snapshot_id)
            .map_err(|_| CsiError::NotFound(format!("unknown snapshot ({snapshot_id})")))?;

        // The source volume's latch comes first.
        let volume = self
            .lookup_volume(token, &sid.volume_id.to_string())
            .await?;

        if let Some(cached) = self.snapshots.acquire_if_cached(&sid.name).await {
            let snap = cached?;
            if snap.data().id.volume_id != volume.data().id {
                return Err(CsiError::Internal(format!(
                    "snapshot ({snapshot_id}) and its cached source volume are inconsistent"
                )));
            }
            return Ok(SnapshotHandle { snap, volume });
        }
        drop(volume);

        let handle = self
            .new_snapshot(token, &sid.name, &sid.volume_id.to_string())
            .await?;
        match handle.state() {
            ResourceState::Creating => {
                let volume_href = handle.volume.data().href.clone();
                match self
                    .client
                    .get_snapshot(token, &volume_href, &sid.name)
                    .await
                {
                    Ok(info) => {
                        handle.data_mut().set_info(&info)?;
                        handle.set_state(ResourceState::Created);
                        Ok(handle)
                    }
                    Err(e) => Err(e),
                }
            }
            ResourceState::Created => Ok(handle),
            ResourceState::Deleted => Err(CsiError::NotFound(format!(
                "snapshot ({snapshot_id}) not found"
            ))),
        }
    }
}
