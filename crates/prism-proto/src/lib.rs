//! Wire protocol for Prism relay communication.
//!
//! This crate defines the framed JSON protocol spoken between the relay,
//! editor instances, and CLI clients. It covers:
//!
//! - Frame codec (length-prefixed JSON over any byte stream)
//! - Message types for registration, dispatch, liveness, and control
//! - The closed set of protocol error codes
//!
//! # Wire Format
//!
//! Every frame is a 4-byte big-endian length header followed by that many
//! bytes of UTF-8 JSON:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────┐
//! │  Length (4, BE)  │        UTF-8 JSON object               │
//! └──────────────────┴───────────────────────────────────────┘
//! ```
//!
//! The maximum payload is 16 MiB. Every JSON object carries a `type` field
//! naming one of the [`MessageType`] discriminants; timestamps are Unix
//! milliseconds.
//!
//! Command `params` and result `data` payloads are opaque to the protocol
//! layer. They are carried as [`serde_json::value::RawValue`] so that the
//! relay forwards them byte-identical without re-serialisation.

pub mod codec;
mod error;
mod message;

pub use codec::{encode_frame, read_frame, write_frame, HEADER_SIZE, MAX_PAYLOAD_BYTES};
pub use error::{ErrorBody, ErrorCode, ProtocolError};
pub use message::{
    now_ms, Ack, Command, CommandResult, ErrorFrame, InstanceStatus, InstanceSummary, Instances,
    ListInstances, Message, MessageType, Ping, Pong, Register, Registered, Request, Response,
    SetDefault, Status,
};

/// Protocol version constants.
pub mod version {
    /// Current protocol version string, carried in REGISTER frames.
    pub const CURRENT: &str = "1.0";
}

/// Default TCP port the relay listens on.
pub const DEFAULT_PORT: u16 = 6500;
