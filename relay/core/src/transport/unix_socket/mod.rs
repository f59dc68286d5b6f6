//! Unix Socket Transport
//!
//! Streaming gateway over Unix domain sockets. Each accepted stream carries
//! CRC frames (see [`frame`](super::frame)) in both directions: client events
//! in, broadcast events out.
//!
//! # Socket Location
//!
//! Default: `$XDG_RUNTIME_DIR/relay/relay.sock`
//! Fallback: `/tmp/relay-$UID/relay.sock`
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID read via `SO_PEERCRED` (Linux) and kept for diagnostics
//! - No network exposure (Unix domain sockets only)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                       ┌─────────────────────────────┐
//! │ UnixSocketClient │                       │ relay daemon                │
//! │                  │      relay.sock       │                             │
//! │  send(event) ───►│──────────────────────►│ FrameSource ─► serve_conn.. │
//! │  ◄── recv()      │◄──────────────────────│ writer task ◄─ ChannelSink  │
//! └──────────────────┘                       └─────────────────────────────┘
//! ```

mod client;
mod server;

pub use client::UnixSocketClient;
pub use server::{
    bind_listener, open_connection, peer_uid, remove_socket, write_frames, FrameSource,
    SocketConnection,
};

use std::path::PathBuf;

/// Get the default socket path for the relay
#[must_use]
pub fn default_socket_path() -> PathBuf {
    crate::config::default_socket_path()
}
