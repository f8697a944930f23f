//! Error types for the relay.

use thiserror::Error;

/// Relay errors.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Failed to bind the listen socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Protocol error on a connection.
    #[error(transparent)]
    Protocol(#[from] prism_proto::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
