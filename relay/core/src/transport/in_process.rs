//! In-Process Transport
//!
//! Channel-based sink and source for clients living in the same process as
//! the hub. The socket gateway also uses `ChannelSink`: its writer task drains
//! the receiving end and turns events into frames.
//!
//! # Usage
//!
//! ```ignore
//! let (client, conn, source) = InProcessClient::connect(32);
//! tokio::spawn(hub.serve_connection(conn, source, shutdown));
//!
//! client.send(StreamEvent::presence("ana", true)).await?;
//! let event = client.recv().await;
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::StreamEvent;
use crate::registry::Connection;

use super::traits::{EventSink, EventSource, TransportError};

/// Sink backed by a bounded channel
///
/// A full channel makes `send` wait; the hub bounds that wait. A dropped
/// receiver makes every later `send` fail.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    /// Wrap an existing sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiver that drains it
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Result<(), TransportError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl EventSource for mpsc::Receiver<StreamEvent> {
    async fn recv(&mut self) -> Result<Option<StreamEvent>, TransportError> {
        Ok(mpsc::Receiver::recv(self).await)
    }
}

/// Client half of an in-process connection
///
/// Dropping the client ends the connection's event stream.
#[derive(Debug)]
pub struct InProcessClient {
    /// Events from this client to the hub
    event_tx: mpsc::Sender<StreamEvent>,
    /// Events broadcast by the hub to this client
    inbox: mpsc::Receiver<StreamEvent>,
}

impl InProcessClient {
    /// Create an in-process client and its hub-side halves
    ///
    /// Returns:
    /// - `InProcessClient`: used by the embedding code
    /// - `Connection`: hand to the hub
    /// - `mpsc::Receiver<StreamEvent>`: the connection's event source
    #[must_use]
    pub fn connect(capacity: usize) -> (Self, Connection, mpsc::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (sink, inbox) = ChannelSink::channel(capacity);
        let client = Self { event_tx, inbox };
        (client, Connection::new(sink), event_rx)
    }

    /// Send an event to the hub
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` once the hub side is gone.
    pub async fn send(&self, event: StreamEvent) -> Result<(), TransportError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next broadcast event
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.inbox.recv().await
    }

    /// Take a broadcast event if one is queued
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.inbox.try_recv().ok()
    }

    /// Stop receiving broadcasts
    ///
    /// The next send from the hub to this client fails.
    pub fn close_inbox(&mut self) {
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.send(StreamEvent::presence("ana", true)).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::presence("ana", true)));
    }

    #[tokio::test]
    async fn test_channel_sink_fails_after_receiver_dropped() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        assert!(sink.is_closed());
        let result = sink.send(StreamEvent::presence("ana", true)).await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_receiver_source_reports_eof() {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(4);
        tx.send(StreamEvent::presence("ana", false)).await.unwrap();
        drop(tx);

        let source: &mut dyn EventSource = &mut rx;
        assert!(source.recv().await.unwrap().is_some());
        assert!(source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_process_client_pairs_halves() {
        let (mut client, conn, mut source) = InProcessClient::connect(4);

        client.send(StreamEvent::typing("ana", "lobby", true)).await.unwrap();
        assert_eq!(
            EventSource::recv(&mut source).await.unwrap(),
            Some(StreamEvent::typing("ana", "lobby", true))
        );

        conn.send(StreamEvent::presence("bo", true)).await.unwrap();
        assert_eq!(client.try_recv(), Some(StreamEvent::presence("bo", true)));

        client.close_inbox();
        assert!(conn.send(StreamEvent::presence("bo", false)).await.is_err());
    }
}
