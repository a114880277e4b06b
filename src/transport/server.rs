//! Socket server that dispatches incoming CSI requests to the service
//! traits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

use super::MAX_MESSAGE_BYTES;

/// A CSI server that accepts UNIX-socket connections and dispatches
/// [`CsiMessage`] requests to a combined
/// [`CsiIdentity`] + [`CsiController`] + [`CsiNode`] implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Binds the socket at `path`, replacing a stale socket file left over
    /// from a previous run.
    pub fn bind(path: &Path, handler: Arc<T>) -> Result<Self, CsiError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed a stale endpoint socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "failed to remove the endpoint path {}: {e}",
                    path.display()
                )))
            }
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| CsiError::Internal(format!("failed to listen on {}: {e}", path.display())))?;
        info!(path = %path.display(), "listening for connections");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handler: Arc::clone(&handler),
        })
    }

    /// The socket path this server is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until the task is cancelled. Every connection is
    /// served on its own task, so requests on disjoint resources proceed
    /// concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        loop {
            let (stream, _addr) = self
                .listener
                .accept()
                .await
                .map_err(|e| CsiError::Internal(format!("accept failed: {e}")))?;
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handler).await {
                    error!(error = %e, "connection handler error");
                }
            });
        }
    }

    /// Processes a single exchange: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_connection(mut stream: UnixStream, handler: Arc<T>) -> Result<(), CsiError> {
        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to read the request: {e}")))?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "request received");
                let response = Self::dispatch(&handler, request).await;
                debug!(%response, "request completed");
                response
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to write the response: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| CsiError::Internal(format!("failed to close the stream: {e}")))?;
        Ok(())
    }

    /// Maps a request variant to the matching trait call and wraps the
    /// outcome in a response variant.
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => match handler.probe().await {
                Ok(ready) => CsiMessage::ProbeResult(ready),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginInfo => match handler.get_plugin_info().await {
                Ok(info) => CsiMessage::PluginInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginCapabilities => match handler.get_plugin_capabilities().await {
                Ok(caps) => CsiMessage::PluginCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => match handler.create_volume(req).await {
                Ok(rsp) => CsiMessage::VolumeCreated(rsp),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::DeleteVolume(req) => match handler.delete_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ControllerPublishVolume(req) => {
                match handler.controller_publish_volume(req).await {
                    Ok(rsp) => CsiMessage::VolumePublished(rsp),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ControllerUnpublishVolume(req) => {
                match handler.controller_unpublish_volume(req).await {
                    Ok(()) => CsiMessage::Ok,
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ValidateVolumeCapabilities(req) => {
                match handler.validate_volume_capabilities(req).await {
                    Ok(rsp) => CsiMessage::CapabilitiesValidated(rsp),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::ListVolumes(req) => match handler.list_volumes(req).await {
                Ok(rsp) => CsiMessage::VolumeList(rsp),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetCapacity(req) => match handler.get_capacity(req).await {
                Ok(rsp) => CsiMessage::Capacity(rsp),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ControllerExpandVolume(req) => {
                match handler.controller_expand_volume(req).await {
                    Ok(rsp) => CsiMessage::VolumeExpanded(rsp),
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::CreateSnapshot(req) => match handler.create_snapshot(req).await {
                Ok(rsp) => CsiMessage::SnapshotCreated(rsp),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::DeleteSnapshot(req) => match handler.delete_snapshot(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ListSnapshots(req) => match handler.list_snapshots(req).await {
                Ok(rsp) => CsiMessage::SnapshotList(rsp),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ControllerGetCapabilities => {
                match handler.controller_get_capabilities().await {
                    Ok(caps) => CsiMessage::ControllerCapabilities(caps),
                    Err(e) => CsiMessage::Error(e),
                }
            }

            // --- Node -------------------------------------------------------
            CsiMessage::NodeStageVolume(req) => match handler.node_stage_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeUnstageVolume(req) => match handler.node_unstage_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodePublishVolume(req) => match handler.node_publish_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeUnpublishVolume(req) => {
                match handler.node_unpublish_volume(req).await {
                    Ok(()) => CsiMessage::Ok,
                    Err(e) => CsiMessage::Error(e),
                }
            }
            CsiMessage::NodeGetInfo => match handler.node_get_info().await {
                Ok(info) => CsiMessage::NodeInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::NodeGetCapabilities => match handler.node_get_capabilities().await {
                Ok(caps) => CsiMessage::NodeCapabilities(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }
}
