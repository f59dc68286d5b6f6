//! Relay Server
//!
//! Accepts streaming clients on the Unix socket, hands each to the hub's
//! receive loop and runs the WebSocket request gateway next to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use relay_core::transport::unix_socket::{bind_listener, open_connection, remove_socket};
use relay_core::transport::websocket::serve_websocket;
use relay_core::{
    ConnectionId, InMemoryStore, MessageService, RelayConfigFile, Shutdown, ShutdownListener,
    StreamHub,
};

/// How often the registry is swept for closed connections
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Time connection loops get to finish after shutdown before being aborted
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Bookkeeping for one accepted streaming client
struct ClientEntry {
    connected_at: SystemTime,
    peer_uid: Option<u32>,
    abort_handle: AbortHandle,
}

/// Per-client statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the client connected
    pub connected_at: SystemTime,
    /// Peer UID from the socket credentials
    pub peer_uid: Option<u32>,
    /// Seconds since the client connected
    pub uptime_secs: u64,
}

/// The relay daemon's server
pub struct RelayServer {
    config: RelayConfigFile,
    hub: StreamHub,
    service: MessageService,
    clients: Arc<DashMap<ConnectionId, ClientEntry>>,
}

impl RelayServer {
    /// Build the hub and message service from `config`
    pub fn new(config: RelayConfigFile) -> Self {
        let hub = StreamHub::new(config.hub_config());
        let service = MessageService::new(
            Arc::new(InMemoryStore::default()),
            config.service_config(),
        );
        Self {
            config,
            hub,
            service,
            clients: Arc::new(DashMap::new()),
        }
    }

    /// The stream hub shared by all streaming clients
    #[cfg(test)]
    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    /// Number of accepted streaming clients
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Statistics for every accepted streaming client
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.clients
            .iter()
            .map(|entry| {
                let uptime_secs = entry
                    .connected_at
                    .elapsed()
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                (
                    *entry.key(),
                    ConnectionStats {
                        connected_at: entry.connected_at,
                        peer_uid: entry.peer_uid,
                        uptime_secs,
                    },
                )
            })
            .collect()
    }

    /// Serve until `shutdown` is triggered
    ///
    /// # Errors
    ///
    /// Fails if the Unix socket or the WebSocket listener cannot be bound.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let socket_path = self.config.socket_path.clone();
        let listener = bind_listener(&socket_path)
            .with_context(|| format!("Failed to bind Unix socket {socket_path:?}"))?;
        info!(path = ?socket_path, "Streaming gateway listening");

        let ws_task = if self.config.websocket_enabled {
            match self.start_websocket(shutdown.listener()).await {
                Ok(task) => Some(task),
                Err(e) => {
                    remove_socket(&socket_path);
                    return Err(e);
                }
            }
        } else {
            info!("WebSocket gateway disabled");
            None
        };

        let cleanup_task = self.spawn_cleanup(shutdown.listener());

        self.accept_loop(&listener, &shutdown).await;

        info!(
            active = self.connection_count(),
            "Stopping, waiting for connections to close"
        );
        for (conn_id, stats) in self.connection_stats() {
            debug!(
                conn_id = %conn_id,
                peer_uid = ?stats.peer_uid,
                connected_at = ?stats.connected_at,
                uptime_secs = stats.uptime_secs,
                "Closing client"
            );
        }
        self.drain().await;

        cleanup_task.abort();
        if let Some(task) = ws_task {
            if let Err(e) = task.await {
                warn!(error = %e, "WebSocket gateway task failed");
            }
        }
        remove_socket(&socket_path);

        let stats = self.hub.stats();
        info!(
            events_received = stats.events_received,
            events_rejected = stats.events_rejected,
            deliveries = stats.deliveries,
            recipients_dropped = stats.recipients_dropped,
            "Relay server stopped"
        );
        Ok(())
    }

    async fn start_websocket(&self, shutdown: ShutdownListener) -> Result<JoinHandle<()>> {
        let addr: SocketAddr = self
            .config
            .ws_addr
            .parse()
            .with_context(|| format!("Invalid WebSocket address: {}", self.config.ws_addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket gateway on {addr}"))?;
        Ok(tokio::spawn(serve_websocket(
            listener,
            self.service.clone(),
            shutdown,
        )))
    }

    fn spawn_cleanup(&self, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.triggered() => break,
                    _ = interval.tick() => {
                        let removed = hub.registry().cleanup_closed();
                        if removed > 0 {
                            debug!(removed, "Swept closed connections");
                        }
                    }
                }
            }
        })
    }

    async fn accept_loop(&self, listener: &UnixListener, shutdown: &Shutdown) {
        let mut stop = shutdown.listener();
        loop {
            tokio::select! {
                biased;

                () = stop.triggered() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.accept(stream, shutdown.listener()),
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    fn accept(&self, stream: UnixStream, shutdown: ShutdownListener) {
        if self.clients.len() >= self.config.max_connections {
            warn!(
                max = self.config.max_connections,
                "Connection limit reached, refusing client"
            );
            drop(stream);
            return;
        }

        let socket = open_connection(stream, self.config.connection_channel_capacity);
        let conn_id = socket.connection.id();
        let peer_uid = socket.peer_uid;
        info!(conn_id = %conn_id, peer_uid = ?peer_uid, "Client connected");

        let hub = self.hub.clone();
        let clients = Arc::clone(&self.clients);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(
            async move {
                // The entry must exist before the exit path removes it
                let _ = registered_rx.await;
                let outcome = hub
                    .serve_connection(socket.connection, socket.source, shutdown)
                    .await;
                clients.remove(&conn_id);
                if let Err(e) = socket.writer.await {
                    debug!(error = %e, "Writer task ended abnormally");
                }
                info!(outcome = ?outcome, "Client finished");
            }
            .instrument(info_span!("connection", %conn_id)),
        );

        self.clients.insert(
            conn_id,
            ClientEntry {
                connected_at: SystemTime::now(),
                peer_uid,
                abort_handle: handle.abort_handle(),
            },
        );
        let _ = registered_tx.send(());
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.clients.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining: Vec<ConnectionId> = self.clients.iter().map(|e| *e.key()).collect();
        for conn_id in remaining {
            if let Some((_, entry)) = self.clients.remove(&conn_id) {
                warn!(conn_id = %conn_id, "Aborting connection that did not close in time");
                entry.abort_handle.abort();
            }
        }
    }
}
