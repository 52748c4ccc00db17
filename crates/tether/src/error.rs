//! Error types for the Tether library

use thiserror::Error;
use std::time::Duration;
use tether_proto::ProtocolError;

/// Main error type for Tether operations
#[derive(Debug, Error)]
pub enum TetherError {
    /// Token missing, invalid, not accepted, or not presented in time
    #[error("Authentication error: {0}")]
    Auth(String),

    /// No destination resolved, or the destination is closed
    #[error("Routing error: {0}")]
    Routing(String),

    /// I/O failure on a single connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Accept loop failure
    #[error("Listener error: {0}")]
    Listener(String),

    /// Missing or invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command handler or remote endpoint reported a failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration
    },

    /// Wire format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Whether this error must end the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Listener(_) | Self::Config(_))
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::from(err))
    }
}
