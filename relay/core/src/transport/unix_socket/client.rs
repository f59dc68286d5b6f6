//! Unix Socket Client
//!
//! Client side of the streaming gateway. Used by tools that want to join the
//! relay from the local machine and by the integration tests.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;

use super::server::FrameSource;
use crate::events::StreamEvent;
use crate::transport::frame::encode;
use crate::transport::traits::{EventSource, TransportError};

/// Client connected to the relay's Unix socket
pub struct UnixSocketClient {
    socket_path: PathBuf,
    source: FrameSource,
    writer: OwnedWriteHalf,
}

impl UnixSocketClient {
    /// Connect to the relay socket at `socket_path`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::IoError` if the socket cannot be reached.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            TransportError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to connect to {socket_path:?}: {e}"),
            ))
        })?;

        let (read_half, writer) = stream.into_split();
        tracing::info!(path = ?socket_path, "Connected to relay");

        Ok(Self {
            socket_path,
            source: FrameSource::new(read_half),
            writer,
        })
    }

    /// Connect using the default socket path
    ///
    /// # Errors
    ///
    /// See [`UnixSocketClient::connect`].
    pub async fn connect_default() -> Result<Self, TransportError> {
        Self::connect(super::default_socket_path()).await
    }

    /// Get the socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send an event to the relay
    ///
    /// # Errors
    ///
    /// Returns an encode error or the IO error from the write.
    pub async fn send(&mut self, event: &StreamEvent) -> Result<(), TransportError> {
        let frame = encode(event)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    /// Wait for the next event broadcast by the relay
    ///
    /// `Ok(None)` means the relay closed the stream.
    ///
    /// # Errors
    ///
    /// Propagates read and decode errors.
    pub async fn recv(&mut self) -> Result<Option<StreamEvent>, TransportError> {
        self.source.recv().await
    }

    /// Close the sending direction, ending this client's event stream
    ///
    /// Broadcasts can still be received until the relay closes its side.
    ///
    /// # Errors
    ///
    /// Returns the IO error from the shutdown.
    pub async fn finish(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for UnixSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixSocketClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}
