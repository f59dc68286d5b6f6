//! Transport Layer for Relay Gateways
//!
//! Adapters that connect clients to the hub and the message service:
//! - `in_process`: Direct channel communication (embedded clients, tests)
//! - `unix_socket`: Streaming gateway over Unix domain sockets
//! - `websocket`: Request/response gateway for browsers
//!
//! The hub only sees the [`EventSink`] and [`EventSource`] traits; everything
//! else in this module is gateway plumbing.
//!
//! # Security
//!
//! - Unix sockets are created with 0600 permissions
//! - The WebSocket gateway binds to localhost unless configured otherwise

pub mod frame;
pub mod in_process;
pub mod traits;
#[cfg(unix)]
pub mod unix_socket;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use in_process::{ChannelSink, InProcessClient};
pub use traits::{EventSink, EventSource, TransportError};

#[cfg(unix)]
pub use unix_socket::{FrameSource, SocketConnection, UnixSocketClient};
