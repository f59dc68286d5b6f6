//! Stream Hub
//!
//! Mediates between attached connections and applies the broadcast policy:
//! every attached connection except the sender receives each event.
//!
//! # Receive Loop
//!
//! ```text
//!   gateway accepts stream
//!            │
//!            ▼
//!   serve_connection(conn, source, shutdown)
//!            │  attach(conn)
//!            ▼
//!   ┌──► source.recv() ──── EOF / fatal error / shutdown ──► detach(conn)
//!   │        │
//!   │        ▼
//!   │  handle_incoming(conn, event)
//!   │        │  validate, then broadcast(event, excluding = conn)
//!   └────────┘
//! ```
//!
//! Broadcasts run inside the sender's own loop, so each recipient sees one
//! sender's events in the order they were received. Sends to the recipients
//! of one broadcast run concurrently, each bounded by `send_timeout`; a
//! recipient whose send fails or times out is detached and the others are
//! unaffected.
//!
//! The dropped recipient's own receive loop wakes on the detach and ends with
//! [`ConnectionOutcome::Dropped`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::events::StreamEvent;
use crate::registry::{ClientRegistry, Connection, ConnectionId};
use crate::shutdown::ShutdownListener;
use crate::transport::EventSource;

/// Default per-recipient send timeout
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single recipient send
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Number of connections that received the event
    pub delivered: usize,
    /// One `RecipientUnreachable` per connection that was dropped
    pub failures: Vec<RelayError>,
}

impl BroadcastReport {
    /// Check if every recipient received the event
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of recipients the broadcast was attempted on
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }

    /// IDs of the recipients that were dropped
    #[must_use]
    pub fn failed_ids(&self) -> Vec<ConnectionId> {
        self.failures
            .iter()
            .filter_map(|err| match err {
                RelayError::RecipientUnreachable { connection, .. } => Some(*connection),
                _ => None,
            })
            .collect()
    }
}

/// Why a receive loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The client closed the stream
    Closed,
    /// The transport failed while receiving
    ReceiveFailed(String),
    /// The hub dropped the connection after a failed send
    Dropped,
    /// The shutdown signal fired
    Shutdown,
    /// The connection could not be attached (already used)
    Rejected,
}

/// Counters kept by the hub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Events accepted from connections
    pub events_received: u64,
    /// Events rejected by validation
    pub events_rejected: u64,
    /// Successful per-recipient deliveries
    pub deliveries: u64,
    /// Recipients dropped after a failed send
    pub recipients_dropped: u64,
}

#[derive(Debug, Default)]
struct HubCounters {
    events_received: AtomicU64,
    events_rejected: AtomicU64,
    deliveries: AtomicU64,
    recipients_dropped: AtomicU64,
}

/// The stream hub
///
/// Cheap to clone; clones share the registry and counters.
#[derive(Debug, Clone)]
pub struct StreamHub {
    registry: ClientRegistry,
    config: HubConfig,
    counters: Arc<HubCounters>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl StreamHub {
    /// Create a hub with an empty registry
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: ClientRegistry::new(),
            config,
            counters: Arc::new(HubCounters::default()),
        }
    }

    /// The hub's registry
    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// The hub's configuration
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a connection
    ///
    /// New connections get no backlog; they only see events broadcast after
    /// this call. Returns false if the handle was already attached or detached.
    pub fn attach(&self, conn: &Connection) -> bool {
        let attached = self.registry.attach(conn);
        if attached {
            info!(conn_id = %conn.id(), active = self.registry.count(), "Client attached");
        }
        attached
    }

    /// Deregister a connection
    ///
    /// Safe to call any number of times from any number of places. Returns
    /// true only for the call that actually removed it.
    pub fn detach(&self, conn: &Connection) -> bool {
        let removed = self.registry.detach(conn);
        if removed {
            info!(conn_id = %conn.id(), active = self.registry.count(), "Client detached");
        } else {
            debug!(conn_id = %conn.id(), "Detach of connection that is not attached");
        }
        removed
    }

    /// Handle one event received from `conn`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidArgument` if the event fails validation;
    /// nothing is broadcast in that case. The connection stays attached.
    pub async fn handle_incoming(
        &self,
        conn: &Connection,
        event: StreamEvent,
    ) -> Result<BroadcastReport, RelayError> {
        if let Err(e) = event.validate() {
            self.counters.events_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        match &event {
            StreamEvent::Message(msg) => {
                debug!(conn_id = %conn.id(), room_id = %msg.room_id, sender_id = %msg.sender_id, "Message");
            }
            StreamEvent::Typing(t) => {
                debug!(conn_id = %conn.id(), user_id = %t.user_id, room_id = %t.room_id, is_typing = t.is_typing, "Typing");
            }
            StreamEvent::Presence(p) => {
                debug!(conn_id = %conn.id(), user_id = %p.user_id, online = p.online, "Presence");
            }
            StreamEvent::Control(c) => {
                debug!(conn_id = %conn.id(), action = ?c.action, room_id = %c.room_id, "Control");
            }
        }

        Ok(self.broadcast(&event, Some(conn.id())).await)
    }

    /// Deliver an event to every attached connection except `excluding`
    ///
    /// Never fails as a whole. A recipient whose send fails or exceeds
    /// `send_timeout` is detached and reported in the result.
    pub async fn broadcast(
        &self,
        event: &StreamEvent,
        excluding: Option<ConnectionId>,
    ) -> BroadcastReport {
        let recipients: Vec<Connection> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| Some(conn.id()) != excluding)
            .collect();

        let timeout = self.config.send_timeout;
        let sends = recipients.iter().map(|conn| async move {
            let reason = match tokio::time::timeout(timeout, conn.send(event.clone())).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("send timed out after {timeout:?}"),
            };
            warn!(conn_id = %conn.id(), reason = %reason, "Failed to send event, removing client");
            self.detach(conn);
            Err(RelayError::RecipientUnreachable {
                connection: conn.id(),
                reason,
            })
        });

        let mut report = BroadcastReport::default();
        for outcome in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failures.push(e),
            }
        }

        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .recipients_dropped
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);

        debug!(
            event_kind = event.kind(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "Broadcast complete"
        );
        report
    }

    /// Run the receive loop for one connection
    ///
    /// Attaches `conn`, feeds every received event to `handle_incoming` and
    /// detaches on exit. Malformed frames and invalid events are logged and
    /// dropped without ending the loop. The detach also runs if the future is
    /// dropped part-way (task abort).
    pub async fn serve_connection<S>(
        &self,
        conn: Connection,
        mut source: S,
        mut shutdown: ShutdownListener,
    ) -> ConnectionOutcome
    where
        S: EventSource,
    {
        if !self.attach(&conn) {
            return ConnectionOutcome::Rejected;
        }
        let _guard = DetachGuard {
            hub: self,
            conn: &conn,
        };

        loop {
            if !conn.is_attached() {
                info!(conn_id = %conn.id(), "Connection dropped by hub, ending receive loop");
                return ConnectionOutcome::Dropped;
            }

            tokio::select! {
                biased;

                () = shutdown.triggered() => {
                    info!(conn_id = %conn.id(), "Shutdown signalled, closing connection");
                    return ConnectionOutcome::Shutdown;
                }

                () = conn.detached() => {
                    info!(conn_id = %conn.id(), "Connection dropped by hub, ending receive loop");
                    return ConnectionOutcome::Dropped;
                }

                received = source.recv() => match received {
                    Ok(Some(_)) if !conn.is_attached() => {
                        info!(conn_id = %conn.id(), "Connection dropped by hub, ending receive loop");
                        return ConnectionOutcome::Dropped;
                    }
                    Ok(Some(event)) => {
                        let kind = event.kind();
                        if let Err(e) = self.handle_incoming(&conn, event).await {
                            warn!(conn_id = %conn.id(), event_kind = kind, error = %e, "Dropping invalid event");
                        }
                    }
                    Ok(None) => {
                        info!(conn_id = %conn.id(), "Client disconnected (EOF)");
                        return ConnectionOutcome::Closed;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(conn_id = %conn.id(), error = %e, "Dropping malformed frame");
                    }
                    Err(e) => {
                        warn!(conn_id = %conn.id(), error = %e, "Receive error");
                        return ConnectionOutcome::ReceiveFailed(e.to_string());
                    }
                }
            }
        }
    }

    /// Snapshot of the hub's counters
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            events_rejected: self.counters.events_rejected.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            recipients_dropped: self.counters.recipients_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Detaches its connection when dropped
struct DetachGuard<'a> {
    hub: &'a StreamHub,
    conn: &'a Connection,
}

impl Drop for DetachGuard<'_> {
    fn drop(&mut self) {
        self.hub.detach(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChatMessage;
    use crate::registry::ConnectionState;
    use crate::shutdown::Shutdown;
    use crate::transport::in_process::{ChannelSink, InProcessClient};
    use crate::transport::{EventSink, TransportError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn create_test_connection() -> (Connection, mpsc::Receiver<StreamEvent>) {
        let (sink, rx) = ChannelSink::channel(32);
        (Connection::new(sink), rx)
    }

    fn hi(sender: &str) -> StreamEvent {
        StreamEvent::Message(ChatMessage::new("lobby", sender, "hi"))
    }

    /// Sink whose transport is broken
    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn send(&self, _event: StreamEvent) -> Result<(), TransportError> {
            Err(TransportError::SendFailed("broken pipe".into()))
        }
    }

    /// Sink that never completes a send
    struct StalledSink;

    #[async_trait]
    impl EventSink for StalledSink {
        async fn send(&self, _event: StreamEvent) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_sender_is_excluded() {
        let hub = StreamHub::default();
        let (a, mut rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        let (c, mut rx_c) = create_test_connection();
        hub.attach(&a);
        hub.attach(&b);
        hub.attach(&c);

        let report = hub.handle_incoming(&a, hi("a")).await.unwrap();

        assert_eq!(report.delivered, 2);
        assert!(report.all_succeeded());
        assert_eq!(rx_b.try_recv().unwrap(), hi("a"));
        assert_eq!(rx_c.try_recv().unwrap(), hi("a"));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_recipient_is_detached() {
        let hub = StreamHub::default();
        let (a, _rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        let broken = Connection::new(FailingSink);
        hub.attach(&a);
        hub.attach(&b);
        hub.attach(&broken);

        let report = hub.handle_incoming(&a, hi("a")).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed_ids(), vec![broken.id()]);
        assert!(rx_b.try_recv().is_ok());
        assert!(!hub.registry().contains(&broken.id()));
        assert_eq!(broken.state(), ConnectionState::Detached);
        assert_eq!(hub.registry().count(), 2);
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_others() {
        let hub = StreamHub::new(HubConfig {
            send_timeout: Duration::from_millis(50),
        });
        let (a, _rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        let stalled = Connection::new(StalledSink);
        hub.attach(&a);
        hub.attach(&stalled);
        hub.attach(&b);

        let report = tokio::time::timeout(Duration::from_secs(2), hub.broadcast(&hi("a"), Some(a.id())))
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed_ids(), vec![stalled.id()]);
        assert!(rx_b.try_recv().is_ok());
        assert!(!hub.registry().contains(&stalled.id()));
    }

    #[tokio::test]
    async fn test_invalid_event_is_not_broadcast() {
        let hub = StreamHub::default();
        let (a, _rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        hub.attach(&a);
        hub.attach(&b);

        let bad = StreamEvent::Message(ChatMessage::new("", "a", "hi"));
        let err = hub.handle_incoming(&a, bad).await.unwrap_err();

        assert!(err.is_invalid_argument());
        assert!(rx_b.try_recv().is_err());
        assert!(hub.registry().contains(&a.id()));
        assert_eq!(hub.stats().events_rejected, 1);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let hub = StreamHub::default();
        let (a, _rx) = create_test_connection();
        hub.attach(&a);

        assert!(hub.detach(&a));
        assert!(!hub.detach(&a));
        assert_eq!(hub.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_new_connection_gets_no_backlog() {
        let hub = StreamHub::default();
        let (a, _rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        hub.attach(&a);
        hub.handle_incoming(&a, hi("a")).await.unwrap();

        hub.attach(&b);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_serve_connection_relays_and_detaches_on_eof() {
        let hub = StreamHub::default();
        let shutdown = Shutdown::new();

        let (mut alice, alice_conn, alice_source) = InProcessClient::connect(8);
        let (mut bob, bob_conn, bob_source) = InProcessClient::connect(8);

        let alice_task = {
            let hub = hub.clone();
            let listener = shutdown.listener();
            tokio::spawn(async move { hub.serve_connection(alice_conn, alice_source, listener).await })
        };
        let bob_task = {
            let hub = hub.clone();
            let listener = shutdown.listener();
            tokio::spawn(async move { hub.serve_connection(bob_conn, bob_source, listener).await })
        };

        while hub.registry().count() < 2 {
            tokio::task::yield_now().await;
        }

        alice.send(hi("alice")).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), bob.recv()).await.unwrap();
        assert_eq!(received, Some(hi("alice")));
        assert!(alice.try_recv().is_none());

        drop(alice);
        assert_eq!(alice_task.await.unwrap(), ConnectionOutcome::Closed);
        assert_eq!(hub.registry().count(), 1);

        shutdown.trigger();
        assert_eq!(bob_task.await.unwrap(), ConnectionOutcome::Shutdown);
        assert_eq!(hub.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_serve_connection_keeps_running_after_invalid_event() {
        let hub = StreamHub::default();
        let shutdown = Shutdown::new();
        let (alice, alice_conn, alice_source) = InProcessClient::connect(8);
        let (bob_conn, mut bob_rx) = create_test_connection();
        hub.attach(&bob_conn);

        let task = {
            let hub = hub.clone();
            let listener = shutdown.listener();
            tokio::spawn(async move { hub.serve_connection(alice_conn, alice_source, listener).await })
        };

        alice
            .send(StreamEvent::Message(ChatMessage::new("lobby", "", "nobody")))
            .await
            .unwrap();
        alice.send(hi("alice")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv()).await.unwrap();
        assert_eq!(received, Some(hi("alice")));

        drop(alice);
        assert_eq!(task.await.unwrap(), ConnectionOutcome::Closed);
    }

    #[tokio::test]
    async fn test_serve_connection_rejects_used_handle() {
        let hub = StreamHub::default();
        let (conn, _rx) = create_test_connection();
        hub.attach(&conn);
        hub.detach(&conn);

        let (_tx, source) = mpsc::channel::<StreamEvent>(1);
        let outcome = hub
            .serve_connection(conn, source, Shutdown::new().listener())
            .await;
        assert_eq!(outcome, ConnectionOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_stalled_recipient_loop_ends_without_further_input() {
        let hub = StreamHub::new(HubConfig {
            send_timeout: Duration::from_millis(50),
        });
        let shutdown = Shutdown::new();
        let (a, _rx_a) = create_test_connection();
        hub.attach(&a);

        // B never reads its inbox and never sends anything
        let (_b_client, b_conn, b_source) = InProcessClient::connect(1);
        let b_id = b_conn.id();
        let b_loop = {
            let hub = hub.clone();
            let listener = shutdown.listener();
            tokio::spawn(async move { hub.serve_connection(b_conn, b_source, listener).await })
        };
        while !hub.registry().contains(&b_id) {
            tokio::task::yield_now().await;
        }

        for _ in 0..3 {
            hub.handle_incoming(&a, hi("a")).await.unwrap();
        }
        assert!(!hub.registry().contains(&b_id));

        let outcome = tokio::time::timeout(Duration::from_secs(1), b_loop)
            .await
            .expect("receive loop kept running after its connection was dropped")
            .unwrap();
        assert_eq!(outcome, ConnectionOutcome::Dropped);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_aborted_loop_still_detaches() {
        let hub = StreamHub::default();
        let (_client, conn, source) = InProcessClient::connect(8);
        let id = conn.id();

        let task = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.serve_connection(conn, source, Shutdown::new().listener())
                    .await
            })
        };
        while !hub.registry().contains(&id) {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert!(!hub.registry().contains(&id));
    }

    #[tokio::test]
    async fn test_per_sender_order_is_preserved() {
        let hub = StreamHub::default();
        let (a, _rx_a) = create_test_connection();
        let (b, mut rx_b) = create_test_connection();
        hub.attach(&a);
        hub.attach(&b);

        for i in 0..20 {
            let event = StreamEvent::Message(ChatMessage::new("lobby", "a", i.to_string()));
            hub.handle_incoming(&a, event).await.unwrap();
        }

        for i in 0..20 {
            match rx_b.recv().await {
                Some(StreamEvent::Message(msg)) => assert_eq!(msg.text, i.to_string()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
