//! Transport Traits
//!
//! The two capabilities a gateway adapter hands to the hub:
//! - `EventSink`: deliver one event to one connection (hub -> client)
//! - `EventSource`: receive the next event from one connection (client -> hub)

use async_trait::async_trait;
use thiserror::Error;

use crate::events::StreamEvent;

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send an event
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Event serialization/deserialization error
    ///
    /// The offending frame has been consumed; the stream is still usable.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Frame exceeds the maximum size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared or actual size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Frame checksum mismatch - data corruption detected
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },

    /// IO error from underlying transport
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TransportError {
    /// Whether the connection can keep receiving after this error
    ///
    /// Only a malformed payload is recoverable: the frame boundary is intact
    /// and the frame has already been skipped.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SerializationError(_))
    }
}

/// Hub -> client delivery for a single connection
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver an event
    ///
    /// Any error is taken as a sign that the connection is gone.
    async fn send(&self, event: StreamEvent) -> Result<(), TransportError>;

    /// Whether the sink can no longer deliver anything
    fn is_closed(&self) -> bool {
        false
    }
}

/// Client -> hub reception for a single connection
#[async_trait]
pub trait EventSource: Send {
    /// Receive the next event
    ///
    /// Returns `Ok(None)` on graceful end of stream.
    async fn recv(&mut self) -> Result<Option<StreamEvent>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::SendFailed("test".to_string());
        assert!(err.to_string().contains("Send failed"));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = TransportError::IoError(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_only_serialization_errors_are_recoverable() {
        assert!(TransportError::SerializationError("bad json".into()).is_recoverable());
        assert!(!TransportError::ConnectionClosed.is_recoverable());
        assert!(!TransportError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_recoverable());
    }
}
