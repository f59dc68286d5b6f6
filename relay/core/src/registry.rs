//! Client Registry - Live Connection Tracking
//!
//! The registry holds every connection whose receive loop is running and which
//! has not yet hit end of stream or a failed send. It is the only shared
//! mutable structure in the core.
//!
//! # Architecture
//!
//! ```text
//!                       ClientRegistry
//!              ┌─────────────────────────────────────┐
//!              │ BTreeMap<ConnectionId, Connection>  │
//!              │   - wrapped in Arc<RwLock<>>        │
//!              └──────────────────┬──────────────────┘
//!                                 │
//!           ┌─────────────────────┼─────────────────────┐
//!           │                     │                     │
//!     ┌─────▼─────┐         ┌─────▼─────┐         ┌─────▼─────┐
//!     │  conn-1   │         │  conn-2   │         │  conn-3   │
//!     │ EventSink │         │ EventSink │         │ EventSink │
//!     └───────────┘         └───────────┘         └───────────┘
//! ```
//!
//! # Thread Safety
//!
//! `attach` and `detach` take the write lock, `snapshot` takes the read lock.
//! Callers iterate over a snapshot so that no send ever happens while the
//! lock is held.
//!
//! # Lifecycle
//!
//! `Unattached -> Attached -> Detached`. State transitions happen under the
//! write lock, so a detached connection can never slip back into the map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::events::StreamEvent;
use crate::transport::{EventSink, TransportError};

/// Unique identifier for a client connection
///
/// Generated from a process-wide counter, so an id is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value (for testing)
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet registered
    Unattached,
    /// Registered and receiving broadcasts
    Attached,
    /// Removed; terminal
    Detached,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unattached,
            1 => Self::Attached,
            _ => Self::Detached,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unattached => 0,
            Self::Attached => 1,
            Self::Detached => 2,
        }
    }
}

struct ConnectionInner {
    id: ConnectionId,
    sink: Box<dyn EventSink>,
    state: AtomicU8,
    detached_tx: watch::Sender<bool>,
    opened_at: Instant,
}

/// Handle to one bidirectional client stream
///
/// Cheap to clone; clones share identity and state. The gateway that opened
/// the stream owns the handle, the registry keeps a clone only while attached.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a new, unattached connection around a sink
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                sink: Box::new(sink),
                state: AtomicU8::new(ConnectionState::Unattached.as_u8()),
                detached_tx: watch::channel(false).0,
                opened_at: Instant::now(),
            }),
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Whether the connection is currently attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state() == ConnectionState::Attached
    }

    /// Whether the underlying sink has closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.sink.is_closed()
    }

    /// Deliver an event through this connection's sink
    ///
    /// # Errors
    ///
    /// Propagates the sink's error.
    pub async fn send(&self, event: StreamEvent) -> Result<(), TransportError> {
        self.inner.sink.send(event).await
    }

    /// Wait until the connection is detached
    ///
    /// Resolves immediately for a connection that already is, whichever
    /// path detached it.
    pub async fn detached(&self) {
        let mut rx = self.inner.detached_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive
        let _ = rx.wait_for(|detached| *detached).await;
    }

    /// Seconds since the connection was created
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.opened_at.elapsed().as_secs()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_detached(&self) {
        self.inner
            .state
            .store(ConnectionState::Detached.as_u8(), Ordering::SeqCst);
        self.inner.detached_tx.send_replace(true);
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of attached connections
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RwLock<BTreeMap<ConnectionId, Connection>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Add a connection to the active set
    ///
    /// Only an `Unattached` connection can be attached. Returns false (and
    /// leaves the registry untouched) for anything else.
    pub fn attach(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.write();
        if !conn.transition(ConnectionState::Unattached, ConnectionState::Attached) {
            tracing::warn!(
                conn_id = %conn.id(),
                state = ?conn.state(),
                "Refusing to attach connection that is not unattached"
            );
            return false;
        }
        inner.insert(conn.id(), conn.clone());
        tracing::debug!(conn_id = %conn.id(), active = inner.len(), "Connection attached");
        true
    }

    /// Remove a connection from the active set
    ///
    /// Marks the connection `Detached` in every case. Returns true only if
    /// this call removed it; a connection that is already gone is a no-op.
    pub fn detach(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.write();
        conn.mark_detached();
        let removed = inner.remove(&conn.id()).is_some();
        if removed {
            tracing::debug!(conn_id = %conn.id(), active = inner.len(), "Connection detached");
        }
        removed
    }

    /// Point-in-time copy of the active set, ordered by connection id
    #[must_use]
    pub fn snapshot(&self) -> Vec<Connection> {
        self.inner.read().values().cloned().collect()
    }

    /// Get the number of attached connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is attached
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Get the IDs of all attached connections
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().keys().copied().collect()
    }

    /// Detach every connection whose sink has closed
    ///
    /// Returns the number of connections removed.
    pub fn cleanup_closed(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.len();

        inner.retain(|id, conn| {
            let closed = conn.is_closed();
            if closed {
                conn.mark_detached();
                tracing::info!(conn_id = %id, "Removing closed connection");
            }
            !closed
        });

        let removed = before - inner.len();
        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = inner.len(),
                "Cleaned up closed connections"
            );
        }
        removed
    }

    /// Get a summary of attached connections
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        RegistrySummary {
            total_connections: inner.len(),
            longest_uptime_secs: inner.values().map(Connection::uptime_secs).max().unwrap_or(0),
        }
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ClientRegistry")
            .field("connection_count", &inner.len())
            .field("connections", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Summary of attached connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySummary {
    /// Total number of attached connections
    pub total_connections: usize,
    /// Uptime of the oldest attached connection
    pub longest_uptime_secs: u64,
}
