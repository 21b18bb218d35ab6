//! Error types shared across the connection, persistence and configuration layers.
//!
//! Connection problems never leave the connection manager as errors; they are
//! turned into state transitions. The remaining kinds are returned to whoever
//! invoked the failing operation.

use thiserror::Error;

/// Broker connect, subscribe or disconnect failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused by broker: {0}")]
    Refused(String),

    #[error("connect timed out after {0}s")]
    Timeout(u64),

    #[error("subscription to {0} rejected")]
    SubscribeRejected(String),

    #[error("client request failed: {0}")]
    Client(String),

    #[error("could not reach broker: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("broker closed the session")]
    Disconnected,
}

/// Inbound payload that could not be turned into a reading.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not a reading: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// Reading repository operation failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("repository I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode reading: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Local configuration storage failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode configuration: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not encode store file: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("storage rejected write: {0}")]
    Rejected(String),
}

/// Connection configuration that cannot be dialled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("broker host is empty")]
    EmptyHost,

    #[error("topic is empty")]
    EmptyTopic,

    #[error("port must be in 1..=65535")]
    InvalidPort,
}
