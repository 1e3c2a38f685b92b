//! Error types for the notification daemon

use thiserror::Error;

/// Main error type for the notification daemon
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Connect failed for {key}: {reason}")]
    ConnectFailed { key: String, reason: String },

    #[error("Join failed for {channel} on {key}: {reason}")]
    JoinFailed {
        key: String,
        channel: String,
        reason: String,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
