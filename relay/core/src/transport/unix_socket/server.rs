//! Unix Socket Server Side
//!
//! Turns an accepted `UnixStream` into the pieces the hub works with: a
//! `Connection` whose sink feeds a frame writer task, and a `FrameSource`
//! that decodes the read half.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::StreamEvent;
use crate::registry::{Connection, ConnectionId};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::in_process::ChannelSink;
use crate::transport::traits::{EventSource, TransportError};

/// Read buffer size for socket reads
const READ_BUFFER_SIZE: usize = 8192;

/// Prepare the socket path, bind, and restrict permissions to the owner
///
/// Creates missing parent directories and removes a stale socket file.
///
/// # Errors
///
/// Returns `TransportError::IoError` if any filesystem step or the bind fails.
pub fn bind_listener(path: &Path) -> Result<UnixListener, TransportError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create socket directory {parent:?}: {e}"),
                ))
            })?;
            tracing::info!(path = ?parent, "Created socket directory");
        }
    }

    if path.exists() {
        tracing::warn!(path = ?path, "Removing stale socket file");
        std::fs::remove_file(path).map_err(|e| {
            TransportError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to remove stale socket {path:?}: {e}"),
            ))
        })?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    tracing::info!(path = ?path, "Listening on Unix socket");
    Ok(listener)
}

/// Remove the socket file if it exists
pub fn remove_socket(path: &Path) {
    if path.exists() {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!(path = ?path, "Socket file removed"),
            Err(e) => tracing::warn!(path = ?path, error = %e, "Failed to remove socket file"),
        }
    }
}

/// Get the UID of the peer process
///
/// Returns `None` where `SO_PEERCRED` is unavailable or the call fails.
#[cfg(target_os = "linux")]
#[must_use]
pub fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    // SAFETY: ucred is plain old data, so the all-zero pattern is valid
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: fd is a live socket owned by `stream`; cred and len point to
    // writable memory of the advertised size
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
            &mut len,
        )
    };

    (result == 0).then_some(cred.uid)
}

/// Get the UID of the peer process (non-Linux fallback)
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn peer_uid(_stream: &UnixStream) -> Option<u32> {
    None
}

/// Event source decoding frames from a byte stream
///
/// A frame whose payload does not deserialize is skipped and reported as a
/// recoverable error. A checksum mismatch or an oversize frame is fatal since
/// the stream can no longer be trusted to be aligned.
pub struct FrameSource<R = OwnedReadHalf> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R> FrameSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }
}

#[async_trait]
impl<R> EventSource for FrameSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<StreamEvent>, TransportError> {
        loop {
            if let Some(event) = self.decoder.decode::<StreamEvent>()? {
                return Ok(Some(event));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.available() > 0 {
                    tracing::debug!(
                        trailing_bytes = self.decoder.available(),
                        "Stream ended inside a frame"
                    );
                }
                return Ok(None);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

/// Drain a connection's outbound channel into a byte stream as frames
///
/// Ends when the channel closes or a write fails. Dropping the receiver on a
/// write failure closes the connection's sink, so the hub's next send to it
/// fails and detaches it.
pub async fn write_frames<W>(
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<StreamEvent>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let frame = match encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "Failed to encode event");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!(conn_id = %conn_id, error = %e, "Write error");
            break;
        }
    }

    rx.close();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(conn_id = %conn_id, error = %e, "Shutdown of write half failed");
    }
    tracing::debug!(conn_id = %conn_id, "Writer finished");
}

/// An accepted socket stream split into hub-facing parts
pub struct SocketConnection {
    /// Handle to register with the hub
    pub connection: Connection,
    /// Decoder over the read half
    pub source: FrameSource,
    /// Task writing broadcast frames to the write half
    pub writer: JoinHandle<()>,
    /// Peer UID from `SO_PEERCRED`, if available
    pub peer_uid: Option<u32>,
}

/// Split an accepted stream and start its writer task
///
/// `capacity` bounds the events buffered for this client; a full buffer makes
/// hub sends wait (up to the hub's send timeout).
#[must_use]
pub fn open_connection(stream: UnixStream, capacity: usize) -> SocketConnection {
    let peer_uid = peer_uid(&stream);
    let (read_half, write_half) = stream.into_split();
    let (sink, rx) = ChannelSink::channel(capacity);
    let connection = Connection::new(sink);
    let writer = tokio::spawn(write_frames(connection.id(), rx, write_half));

    SocketConnection {
        connection,
        source: FrameSource::new(read_half),
        writer,
        peer_uid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChatMessage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_bind_listener_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("nested").join("test.sock");

        let _listener = bind_listener(&socket_path).unwrap();

        assert!(socket_path.exists());
        let perms = std::fs::metadata(&socket_path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);

        remove_socket(&socket_path);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_listener_replaces_stale_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        drop(bind_listener(&socket_path).unwrap());
        assert!(socket_path.exists());

        // A second bind on the same path succeeds
        let _listener = bind_listener(&socket_path).unwrap();
    }

    #[tokio::test]
    async fn test_frame_source_reads_across_chunks() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut source = FrameSource::new(server);

        let event = StreamEvent::Message(ChatMessage::new("lobby", "ana", "x".repeat(200)));
        let frame = encode(&event).unwrap();
        tokio::spawn(async move {
            for chunk in frame.chunks(16) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let received = tokio::time::timeout(Duration::from_secs(1), source.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(event));
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_source_skips_unknown_event() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut source = FrameSource::new(server);

        client
            .write_all(&frame_bytes(br#"{"type":"reaction","data":{}}"#))
            .await
            .unwrap();
        client
            .write_all(&encode(&StreamEvent::presence("ana", true)).unwrap())
            .await
            .unwrap();
        drop(client);

        let err = source.recv().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            source.recv().await.unwrap(),
            Some(StreamEvent::presence("ana", true))
        );
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_source_corruption_is_fatal() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut source = FrameSource::new(server);

        let mut frame = encode(&StreamEvent::presence("ana", true)).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        client.write_all(&frame).await.unwrap();

        let err = source.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::ChecksumMismatch { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_frames_encodes_in_order() {
        let (writer, reader) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(write_frames(ConnectionId::from_raw(1), rx, writer));

        tx.send(StreamEvent::typing("ana", "lobby", true)).await.unwrap();
        tx.send(StreamEvent::typing("ana", "lobby", false)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let mut source = FrameSource::new(reader);
        assert_eq!(
            source.recv().await.unwrap(),
            Some(StreamEvent::typing("ana", "lobby", true))
        );
        assert_eq!(
            source.recv().await.unwrap(),
            Some(StreamEvent::typing("ana", "lobby", false))
        );
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_connection_reports_peer_uid() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let listener = bind_listener(&socket_path).unwrap();

        let _client = UnixStream::connect(&socket_path).await.unwrap();
        let (stream, _addr) = listener.accept().await.unwrap();
        let socket = open_connection(stream, 8);

        #[cfg(target_os = "linux")]
        {
            // SAFETY: getuid has no preconditions
            let me = unsafe { libc::getuid() };
            assert_eq!(socket.peer_uid, Some(me));
        }
        assert!(!socket.connection.is_attached());
        socket.writer.abort();
    }
}
