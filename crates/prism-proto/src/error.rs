//! Error types and the wire-level error code set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors.
///
/// These are fatal for the connection they occur on: the peer is sent a
/// best-effort ERROR frame and the socket is closed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload exceeds the 16 MiB frame cap.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Length header declared a zero-byte payload.
    #[error("zero-length frame")]
    ZeroLengthFrame,

    /// Payload was not a valid JSON object.
    #[error("malformed JSON payload: {0}")]
    MalformedJson(String),

    /// The `type` field named no known message.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// REGISTER carried an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Maps this error to the wire-level code reported to the peer.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::MalformedJson(_) => ErrorCode::MalformedJson,
            Self::UnsupportedVersion(_) => ErrorCode::ProtocolVersionMismatch,
            Self::ZeroLengthFrame | Self::UnknownMessageType(_) | Self::Io(_) => {
                ErrorCode::ProtocolError
            }
        }
    }
}

/// Wire-level error codes (closed set).
///
/// Carried inside RESPONSE, ERROR, and REGISTERED frames to allow
/// structured error handling on both sides. Codes are grouped by family:
/// routing/state, command, timeout, and protocol/framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Routing / instance state
    /// No instance matches the requested identifier.
    InstanceNotFound,
    /// Instance is reloading its in-process subsystems.
    InstanceReloading,
    /// Instance already has a command in flight and queueing is off.
    InstanceBusy,
    /// Instance connection was lost.
    InstanceDisconnected,
    /// Per-instance command queue is at capacity.
    QueueFull,

    // Command execution
    /// Editor does not recognise the command name.
    CommandNotFound,
    /// Command parameters were rejected by the editor.
    InvalidParams,
    /// Command is not in the instance's advertised capability set.
    CapabilityNotSupported,

    // Timing
    /// No reply within the request deadline.
    Timeout,

    // Internal
    /// Unexpected failure inside the relay or editor.
    InternalError,

    // Protocol / framing (fatal for the connection)
    /// Frame-level violation.
    ProtocolError,
    /// Payload was not valid JSON.
    MalformedJson,
    /// Frame exceeded the payload cap.
    PayloadTooLarge,
    /// REGISTER protocol version not supported.
    ProtocolVersionMismatch,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstanceNotFound => "INSTANCE_NOT_FOUND",
            Self::InstanceReloading => "INSTANCE_RELOADING",
            Self::InstanceBusy => "INSTANCE_BUSY",
            Self::InstanceDisconnected => "INSTANCE_DISCONNECTED",
            Self::QueueFull => "QUEUE_FULL",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::CapabilityNotSupported => "CAPABILITY_NOT_SUPPORTED",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::MalformedJson => "MALFORMED_JSON",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
        }
    }

    /// Parses a wire representation back into a code.
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "INSTANCE_NOT_FOUND" => Some(Self::InstanceNotFound),
            "INSTANCE_RELOADING" => Some(Self::InstanceReloading),
            "INSTANCE_BUSY" => Some(Self::InstanceBusy),
            "INSTANCE_DISCONNECTED" => Some(Self::InstanceDisconnected),
            "QUEUE_FULL" => Some(Self::QueueFull),
            "COMMAND_NOT_FOUND" => Some(Self::CommandNotFound),
            "INVALID_PARAMS" => Some(Self::InvalidParams),
            "CAPABILITY_NOT_SUPPORTED" => Some(Self::CapabilityNotSupported),
            "TIMEOUT" => Some(Self::Timeout),
            "INTERNAL_ERROR" => Some(Self::InternalError),
            "PROTOCOL_ERROR" => Some(Self::ProtocolError),
            "MALFORMED_JSON" => Some(Self::MalformedJson),
            "PAYLOAD_TOO_LARGE" => Some(Self::PayloadTooLarge),
            "PROTOCOL_VERSION_MISMATCH" => Some(Self::ProtocolVersionMismatch),
            _ => None,
        }
    }

    /// Whether a client should retry the same request identifier.
    ///
    /// Retryable codes describe transient instance state; everything else
    /// surfaces immediately.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::InstanceReloading | Self::InstanceBusy | Self::QueueFull | Self::Timeout
        )
    }

    /// Whether this code terminates the connection it was reported on.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::ProtocolError
                | Self::MalformedJson
                | Self::PayloadTooLarge
                | Self::ProtocolVersionMismatch
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error payload carried inside response frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code from the closed set.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorBody {
    /// Creates an error body.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
