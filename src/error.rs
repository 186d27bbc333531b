//! Error types for the pub/sub engine.

use crate::types::MessageId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for pub/sub operations.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport rejected command: {0}")]
    Transport(String),

    #[error("Payload too large: {size} bytes (limit is {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Timed out after {0:?} waiting for a queue message")]
    QueueTimeout(Duration),

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Dispatcher is stopped")]
    DispatcherStopped,

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PubSubError {
    /// Whether this error means the transport connection is unusable and
    /// must be reopened.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, PubSubError::Connection(_))
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(e: serde_json::Error) -> Self {
        PubSubError::Serialization(e.to_string())
    }
}

/// Only failures of the connection itself force a reconnect; errors the
/// server raised for one statement leave the session usable.
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PubSubError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PubSubError::Connection(e.to_string()),
            other => PubSubError::Transport(other.to_string()),
        }
    }
}

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
