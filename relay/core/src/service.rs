//! Message Service
//!
//! Unary request/response operations: submit a message, read a room's history.
//! These run independently of the stream hub; a submitted message is stored,
//! not broadcast.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::RelayError;
use crate::events::ChatMessage;
use crate::store::{InMemoryStore, MessageStore};

/// Default deadline for one unary request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// History size returned when the caller gives no usable limit
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Largest history a single request may ask for
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline applied by the `*_within` helpers when the caller has none
    pub request_timeout: Duration,
    /// History size for `limit <= 0`
    pub default_history_limit: usize,
    /// Upper clamp for requested history size
    pub max_history_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_history_limit: DEFAULT_HISTORY_LIMIT,
            max_history_limit: MAX_HISTORY_LIMIT,
        }
    }
}

/// Request/response message service
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn MessageStore>,
    config: ServiceConfig,
}

impl Default for MessageService {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), ServiceConfig::default())
    }
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl MessageService {
    /// Create a service over a store
    pub fn new(store: Arc<dyn MessageStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    /// The backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// The service configuration
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate, finalize and store a message
    ///
    /// Returns the stored message with `id` and `created_at` filled in.
    /// Explicit values supplied by the caller are kept.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidArgument` if `room_id` or `sender_id` is
    /// missing; the store is not touched. Store failures are propagated.
    pub async fn submit_message(&self, msg: ChatMessage) -> Result<ChatMessage, RelayError> {
        let msg = msg.finalize()?;
        self.store.append(&msg.room_id, msg.clone()).await?;
        info!(
            message_id = %msg.id,
            room_id = %msg.room_id,
            sender_id = %msg.sender_id,
            "Message stored"
        );
        Ok(msg)
    }

    /// Read the most recent messages of a room, oldest first
    ///
    /// `limit <= 0` means the configured default; larger values are clamped
    /// to the configured maximum. An unknown room yields an empty vector.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get_messages(
        &self,
        room_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let effective = self.effective_limit(limit);
        let messages = self.store.query(room_id, effective).await?;
        debug!(room_id, requested = limit, effective, returned = messages.len(), "History read");
        Ok(messages)
    }

    /// `submit_message` bounded by a deadline
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DeadlineExceeded` if the deadline elapses first.
    pub async fn submit_message_within(
        &self,
        msg: ChatMessage,
        deadline: Duration,
    ) -> Result<ChatMessage, RelayError> {
        within(deadline, self.submit_message(msg)).await
    }

    /// `get_messages` bounded by a deadline
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DeadlineExceeded` if the deadline elapses first.
    pub async fn get_messages_within(
        &self,
        room_id: &str,
        limit: i64,
        deadline: Duration,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        within(deadline, self.get_messages(room_id, limit)).await
    }

    fn effective_limit(&self, limit: i64) -> usize {
        if limit <= 0 {
            return self.config.default_history_limit;
        }
        usize::try_from(limit)
            .unwrap_or(usize::MAX)
            .min(self.config.max_history_limit)
    }
}

async fn within<T, F>(deadline: Duration, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| RelayError::DeadlineExceeded(deadline))?
}
