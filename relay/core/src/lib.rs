//! Relay Core - Real-Time Chat Relay
//!
//! This crate holds the relay's logic, independent of how clients reach it:
//! a stream hub that fans events out to every other attached client, the
//! registry of attached clients, and a request/response service over an
//! append-only message history.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Gateways                              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │ Unix socket      │  │ WebSocket        │  │ In-process   │  │
//! │  │ (CRC frames)     │  │ (JSON requests)  │  │ (channels)   │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └──────┬───────┘  │
//! └───────────┼─────────────────────┼───────────────────┼──────────┘
//!             │ StreamEvent         │ unary             │ StreamEvent
//! ┌───────────┼─────────────────────┼───────────────────┼──────────┐
//! │           ▼                     ▼                   ▼          │
//! │     ┌───────────┐        ┌────────────────┐                    │
//! │     │ StreamHub │◄───────┤ (independent)  │                    │
//! │     │  registry │        │ MessageService │──► MessageStore    │
//! │     └───────────┘        └────────────────┘                    │
//! │                         RELAY CORE                             │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamHub`]: Attaches connections and broadcasts their events
//! - [`ClientRegistry`]: The set of currently attached connections
//! - [`StreamEvent`]: The closed set of events a stream carries
//! - [`MessageService`]: Submit a message, read a room's history
//! - [`MessageStore`]: History storage trait, [`InMemoryStore`] by default
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{InProcessClient, Shutdown, StreamEvent, StreamHub};
//!
//! let hub = StreamHub::default();
//! let shutdown = Shutdown::new();
//!
//! let (mut client, conn, source) = InProcessClient::connect(32);
//! tokio::spawn({
//!     let hub = hub.clone();
//!     let listener = shutdown.listener();
//!     async move { hub.serve_connection(conn, source, listener).await }
//! });
//!
//! client.send(StreamEvent::presence("ana", true)).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`events`]: Stream events and chat messages
//! - [`registry`]: Connection handles and the client registry
//! - [`hub`]: Broadcast policy and the per-connection receive loop
//! - [`service`]: Unary submit/history operations
//! - [`store`]: Message history storage
//! - [`config`]: TOML/env/CLI configuration
//! - [`shutdown`]: Process-wide shutdown signal
//! - [`transport`]: Gateway adapters (Unix socket, WebSocket, in-process)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use error::RelayError;
pub use events::{
    ChatMessage, ControlAction, ControlSignal, PresenceSignal, StreamEvent, TypingSignal,
};
pub use hub::{BroadcastReport, ConnectionOutcome, HubConfig, HubStats, StreamHub};
pub use registry::{ClientRegistry, Connection, ConnectionId, ConnectionState, RegistrySummary};
pub use service::{MessageService, ServiceConfig};
pub use shutdown::{Shutdown, ShutdownListener};
pub use store::{InMemoryStore, MessageStore};
pub use transport::{
    ChannelSink, EventSink, EventSource, FrameDecoder, InProcessClient, TransportError,
};

// Config exports
pub use config::{
    default_config_path, default_socket_path, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, RelayConfigFile, RelayToml,
};
