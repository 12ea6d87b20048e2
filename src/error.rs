//! Error types for the dispatch service.

use crate::broker::ConnectionState;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker connection and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker channel unavailable (connection is {state})")]
    ChannelUnavailable { state: ConnectionState },

    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to open broker channel: {0}")]
    Channel(String),

    #[error("Failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Consume on {queue} failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("Reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Failed to close broker connection: {0}")]
    Close(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by job submission.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Broker channel unavailable (connection is {state})")]
    ChannelUnavailable { state: ConnectionState },

    #[error("Dispatch failed for session {session_id}: {reason}")]
    DispatchFailed { session_id: String, reason: String },
}

impl DispatchError {
    /// Map a publish failure for `session_id` into the submission taxonomy.
    pub fn from_publish(session_id: &str, err: BrokerError) -> Self {
        match err {
            BrokerError::ChannelUnavailable { state } => Self::ChannelUnavailable { state },
            other => Self::DispatchFailed {
                session_id: session_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Job ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
