//! Message Store
//!
//! Append-only history keyed by room. The request/response service writes to
//! it and reads from it; the stream hub never touches it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RelayError;
use crate::events::ChatMessage;

/// Message store trait
///
/// Implement this trait to keep history somewhere other than memory.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Get the store name (e.g., "memory")
    fn name(&self) -> &str;

    /// Append a finalized message to a room's history
    async fn append(&self, room_id: &str, msg: ChatMessage) -> Result<(), RelayError>;

    /// Get up to `limit` of the most recent messages in a room
    ///
    /// Oldest first. An unknown room yields an empty vector.
    async fn query(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>, RelayError>;

    /// Number of rooms that have at least one message
    async fn room_count(&self) -> usize;

    /// Total number of stored messages
    async fn message_count(&self) -> usize;
}

/// In-memory message store
///
/// Nothing is evicted; history lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rooms: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, room_id: &str, msg: ChatMessage) -> Result<(), RelayError> {
        if room_id.is_empty() {
            return Err(RelayError::InvalidArgument("room_id is required".into()));
        }
        let mut rooms = self.rooms.write();
        let history = rooms.entry(room_id.to_string()).or_default();
        history.push(msg);
        tracing::trace!(room_id, len = history.len(), "Message appended");
        Ok(())
    }

    async fn query(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>, RelayError> {
        let rooms = self.rooms.read();
        let Some(history) = rooms.get(room_id) else {
            return Ok(Vec::new());
        };
        let start = history.len().saturating_sub(limit);
        Ok(history[start..].to_vec())
    }

    async fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    async fn message_count(&self) -> usize {
        self.rooms.read().values().map(Vec::len).sum()
    }
}
