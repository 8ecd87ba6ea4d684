//! Error types for subscription and stats operations.

use crate::types::SubscriptionId;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TemporarilyUnavailable,
    Inconsistent,
    InvalidRequest,
    Internal,
}

/// Main error type for registry and stats operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Event type not found: {event_type} (subscription {subscription})")]
    EventTypeNotFound {
        subscription: SubscriptionId,
        event_type: String,
    },

    #[error("Stats temporarily unavailable for {subscription}: {reason} (retry after {retry_after:?})")]
    TemporarilyUnavailable {
        subscription: SubscriptionId,
        reason: String,
        retry_after: Duration,
    },

    #[error("Inconsistent offsets for {subscription}: {event_types:?} (retry after {retry_after:?})")]
    Inconsistent {
        subscription: SubscriptionId,
        event_types: Vec<String>,
        retry_after: Duration,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid registry format: {0}")]
    InvalidFormat(String),

    #[error("Registry is locked by another process")]
    Locked,
}

impl SubscriptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubscriptionError::SubscriptionNotFound(_)
            | SubscriptionError::EventTypeNotFound { .. } => ErrorKind::NotFound,
            SubscriptionError::TemporarilyUnavailable { .. } => ErrorKind::TemporarilyUnavailable,
            SubscriptionError::Inconsistent { .. } => ErrorKind::Inconsistent,
            SubscriptionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TemporarilyUnavailable | ErrorKind::Inconsistent
        )
    }

    /// Suggested delay before the caller retries.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SubscriptionError::TemporarilyUnavailable { retry_after, .. }
            | SubscriptionError::Inconsistent { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriptionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriptionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriptionError::Deserialization(e.to_string())
    }
}

/// Result type for registry and stats operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;

/// Failure reported by an offset source or timestamp resolver.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Network trouble, timeouts, overloaded shards.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The event type does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}
