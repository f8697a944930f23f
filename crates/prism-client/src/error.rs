//! Error types for the client transport.

use thiserror::Error;

use prism_proto::{ErrorCode, ProtocolError};

/// Client transport errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not open a connection to the relay.
    #[error("cannot connect to relay at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// The connection dropped mid-call. Transient: a fresh connection is
    /// opened and the call re-sent with the same identifier.
    #[error("connection to relay lost: {0}")]
    ConnectionLost(String),

    /// No reply arrived within the wait window. Transient.
    #[error("no reply within {0} ms")]
    ReplyTimedOut(u64),

    /// Protocol violation on the connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Structured error reported by the relay or the editor.
    #[error("{code}: {message}")]
    Relay { code: ErrorCode, message: String },

    /// The relay answered with a frame that makes no sense here.
    #[error("unexpected {0} frame from relay")]
    UnexpectedMessage(String),
}

impl ClientError {
    /// Whether the retry loop should try again with the same identifier.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Relay { code, .. } => code.is_retryable(),
            Self::ConnectionLost(_) | Self::ReplyTimedOut(_) => true,
            Self::Connect { .. } | Self::Protocol(_) | Self::UnexpectedMessage(_) => false,
        }
    }

    /// The structured error code, when the relay reported one.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Relay { code, .. } => Some(*code),
            _ => None,
        }
    }
}
