//! Error taxonomy for the connectivity core

use thiserror::Error;

/// Errors surfaced by transports, sessions and the orchestrator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Attribute service or characteristic not found")]
    ServiceNotFound,

    #[error("Connection lost: {0}")]
    ReadFailure(String),

    #[error("Attribute link disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to send: {0}")]
    WriteFailure(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection manager closed")]
    Closed,
}

/// Errors building outbound protocol frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid time '{0}': expected HH:MM")]
    InvalidTime(String),

    #[error("Please set all reminder times (missing {0})")]
    IncompleteSchedule(&'static str),
}
