//! One-shot request client for the UNIX-socket transport.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::CsiError;
use crate::message::CsiMessage;

use super::MAX_MESSAGE_BYTES;

/// Client side of the transport: one connection per request.
pub struct CsiClient {
    path: PathBuf,
}

impl CsiClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends one request and awaits the response. An `Error` response is
    /// surfaced as the embedded [`CsiError`].
    pub async fn call(&self, request: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
            CsiError::Internal(format!("failed to connect to {}: {e}", self.path.display()))
        })?;

        let payload = serde_json::to_vec(request).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to send the request: {e}")))?;
        // Half-close so the server sees end-of-request.
        stream
            .shutdown()
            .await
            .map_err(|e| CsiError::Internal(format!("failed to close the send side: {e}")))?;

        let mut buf = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to read the response: {e}")))?;

        let response: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::Internal(format!("malformed response: {e}")))?;
        match response {
            CsiMessage::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}
