//! Relay Errors
//!
//! Errors produced by the hub, the message service and the message store.
//! None of them is fatal to the process: validation errors end the single
//! offending operation, recipient errors stay local to that recipient.

use std::time::Duration;

use thiserror::Error;

use crate::registry::ConnectionId;

/// Errors from relay operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A required field is missing
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Sending to one attached connection failed
    #[error("recipient {connection} unreachable: {reason}")]
    RecipientUnreachable {
        /// The recipient that failed
        connection: ConnectionId,
        /// Why the send failed
        reason: String,
    },

    /// The connection is not (or no longer) attached
    #[error("connection {0} is not attached")]
    NotAttached(ConnectionId),

    /// A unary operation ran past its deadline
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The message store failed
    #[error("message store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Stable error code reported by gateways
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::RecipientUnreachable { .. } => "unavailable",
            Self::NotAttached(_) => "not_found",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Store(_) => "internal",
        }
    }

    /// Whether the caller supplied bad input
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
