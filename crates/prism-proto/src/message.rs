//! Message types for the relay protocol.
//!
//! Each frame carries exactly one message. The `type` field discriminates;
//! the remaining fields follow the per-message schemas below. Opaque
//! payloads (`params`, `data`) are kept as raw JSON so forwarding never
//! re-serialises them.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{ErrorBody, ErrorCode, ProtocolError};

/// Message type discriminant, carried in every frame's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Editor → relay
    Register,
    Status,
    CommandResult,
    Pong,

    // Relay → editor
    Registered,
    Ping,
    Command,

    // Client → relay
    Request,
    ListInstances,
    SetDefault,

    // Relay → client
    Response,
    Instances,
    Ack,
    Error,
}

impl MessageType {
    /// Returns the wire representation of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Status => "STATUS",
            Self::CommandResult => "COMMAND_RESULT",
            Self::Pong => "PONG",
            Self::Ping => "PING",
            Self::Command => "COMMAND",
            Self::Request => "REQUEST",
            Self::ListInstances => "LIST_INSTANCES",
            Self::SetDefault => "SET_DEFAULT",
            Self::Response => "RESPONSE",
            Self::Instances => "INSTANCES",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }

    /// Parses a wire representation back into a type.
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "REGISTER" => Some(Self::Register),
            "REGISTERED" => Some(Self::Registered),
            "STATUS" => Some(Self::Status),
            "COMMAND_RESULT" => Some(Self::CommandResult),
            "PONG" => Some(Self::Pong),
            "PING" => Some(Self::Ping),
            "COMMAND" => Some(Self::Command),
            "REQUEST" => Some(Self::Request),
            "LIST_INSTANCES" => Some(Self::ListInstances),
            "SET_DEFAULT" => Some(Self::SetDefault),
            "RESPONSE" => Some(Self::Response),
            "INSTANCES" => Some(Self::Instances),
            "ACK" => Some(Self::Ack),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance lifecycle status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Connected and able to accept a command.
    Ready,
    /// Executing a command.
    Busy,
    /// Restarting in-process subsystems; connection will drop and return.
    Reloading,
    /// Connection lost. Terminal for the connection object.
    Disconnected,
}

impl InstanceStatus {
    /// Returns the wire representation of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Reloading => "reloading",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parses a wire representation back into a status.
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(Self::Ready),
            "busy" => Some(Self::Busy),
            "reloading" => Some(Self::Reloading),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ===== Editor → relay =====

/// Editor registration handshake. Always the first frame on an editor
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    #[serde(rename = "type")]
    kind: MessageType,
    /// Protocol version the editor speaks.
    pub protocol_version: String,
    /// Stable instance identifier (the absolute project path).
    pub instance_id: String,
    /// Human-readable project name.
    pub project_name: String,
    /// Engine version string.
    pub unity_version: String,
    /// Commands this instance supports. Empty means unrestricted.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub ts: u64,
}

impl Register {
    /// Creates a registration frame for the current protocol version.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        project_name: impl Into<String>,
        unity_version: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            kind: MessageType::Register,
            protocol_version: crate::version::CURRENT.to_owned(),
            instance_id: instance_id.into(),
            project_name: project_name.into(),
            unity_version: unity_version.into(),
            capabilities,
            ts: now_ms(),
        }
    }

    /// Overrides the protocol version (for compatibility testing).
    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }
}

/// Status notification from the editor (e.g. a reload starting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "type")]
    kind: MessageType,
    pub instance_id: String,
    /// Reported status. Kept as a string so unknown values can be logged
    /// and ignored instead of killing the connection.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub ts: u64,
}

impl Status {
    /// Creates a status notification.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Status,
            instance_id: instance_id.into(),
            status: status.into(),
            detail: None,
            ts: now_ms(),
        }
    }

    /// Attaches a human-readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Result of a command execution, sent by the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "type")]
    kind: MessageType,
    /// Request identifier this result answers.
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub ts: u64,
}

impl CommandResult {
    /// Creates a successful result carrying the given payload.
    #[must_use]
    pub fn success(id: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self {
            kind: MessageType::CommandResult,
            id: id.into(),
            success: true,
            data,
            error: None,
            ts: now_ms(),
        }
    }

    /// Creates a failed result carrying the given error.
    #[must_use]
    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            kind: MessageType::CommandResult,
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
            ts: now_ms(),
        }
    }
}

/// Liveness probe reply. Echoes the probe's timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    #[serde(rename = "type")]
    kind: MessageType,
    pub ts: u64,
    /// Timestamp of the PING being answered.
    pub echo_ts: u64,
}

impl Pong {
    /// Creates a reply to the given probe.
    #[must_use]
    pub fn answering(ping: &Ping) -> Self {
        Self {
            kind: MessageType::Pong,
            ts: now_ms(),
            echo_ts: ping.ts,
        }
    }
}

// ===== Relay → editor =====

/// Registration outcome, sent in reply to REGISTER.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registered {
    #[serde(rename = "type")]
    kind: MessageType,
    pub success: bool,
    /// Negotiated liveness probe interval.
    pub heartbeat_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub ts: u64,
}

impl Registered {
    /// Creates an acceptance carrying the negotiated probe interval.
    #[must_use]
    pub fn accepted(heartbeat_interval_ms: u64) -> Self {
        Self {
            kind: MessageType::Registered,
            success: true,
            heartbeat_interval_ms,
            error: None,
            ts: now_ms(),
        }
    }

    /// Creates a rejection carrying the given error.
    #[must_use]
    pub fn rejected(error: ErrorBody) -> Self {
        Self {
            kind: MessageType::Registered,
            success: false,
            heartbeat_interval_ms: 0,
            error: Some(error),
            ts: now_ms(),
        }
    }
}

/// Liveness probe sent by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    #[serde(rename = "type")]
    kind: MessageType,
    pub ts: u64,
}

impl Ping {
    /// Creates a probe stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: MessageType::Ping,
            ts: now_ms(),
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

/// Command forwarded to the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    kind: MessageType,
    /// Request identifier, echoed back in COMMAND_RESULT.
    pub id: String,
    pub command: String,
    pub params: Box<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Command {
    /// Creates a command frame.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        params: Box<RawValue>,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            kind: MessageType::Command,
            id: id.into(),
            command: command.into(),
            params,
            timeout_ms,
        }
    }
}

// ===== Client → relay =====

/// Command request from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    kind: MessageType,
    /// Idempotency key of shape `<client-id>:<uuid>`.
    pub id: String,
    /// Target instance. Absent means the default instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub command: String,
    pub params: Box<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub ts: u64,
}

impl Request {
    /// Creates a request frame.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        instance_id: Option<String>,
        command: impl Into<String>,
        params: Box<RawValue>,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            kind: MessageType::Request,
            id: id.into(),
            instance_id,
            command: command.into(),
            params,
            timeout_ms,
            ts: now_ms(),
        }
    }
}

/// Request for a point-in-time snapshot of all instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListInstances {
    #[serde(rename = "type")]
    kind: MessageType,
}

impl ListInstances {
    /// Creates a snapshot request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: MessageType::ListInstances,
        }
    }
}

impl Default for ListInstances {
    fn default() -> Self {
        Self::new()
    }
}

/// Sets the default instance for requests with no explicit target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDefault {
    #[serde(rename = "type")]
    kind: MessageType,
    pub instance_id: String,
}

impl SetDefault {
    /// Creates a set-default request.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            kind: MessageType::SetDefault,
            instance_id: instance_id.into(),
        }
    }
}

// ===== Relay → client =====

/// Terminal reply to a REQUEST: success with data, or a structured error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    kind: MessageType,
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Creates a success reply.
    #[must_use]
    pub fn success(id: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self {
            kind: MessageType::Response,
            id: id.into(),
            success: true,
            data,
            error: None,
        }
    }

    /// Creates a failure reply.
    #[must_use]
    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            kind: MessageType::Response,
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Creates a failure reply from a bare code and message.
    #[must_use]
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(id, ErrorBody::new(code, message))
    }
}

/// One row of the LIST_INSTANCES snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    /// Instance identifier (the project path).
    pub id: String,
    pub project_name: String,
    /// Engine version string.
    pub version: String,
    pub status: InstanceStatus,
    pub capabilities: Vec<String>,
    /// Whether this instance currently receives untargeted requests.
    pub is_default: bool,
    /// Commands waiting in the per-instance queue.
    pub queue_size: usize,
}

/// Snapshot reply to LIST_INSTANCES.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instances {
    #[serde(rename = "type")]
    kind: MessageType,
    pub instances: Vec<InstanceSummary>,
}

impl Instances {
    /// Creates a snapshot reply.
    #[must_use]
    pub fn new(instances: Vec<InstanceSummary>) -> Self {
        Self {
            kind: MessageType::Instances,
            instances,
        }
    }
}

/// Acknowledgement of SET_DEFAULT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "type")]
    kind: MessageType,
    pub instance_id: String,
}

impl Ack {
    /// Creates an acknowledgement.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Ack,
            instance_id: instance_id.into(),
        }
    }
}

/// Connection-fatal error notification, sent best-effort before close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorFrame {
    /// Creates an error frame.
    #[must_use]
    pub fn new(id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            id,
            code,
            message: message.into(),
        }
    }
}

// ===== Sum type =====

/// Any protocol message.
///
/// Serialisation delegates to the variant, whose embedded `type` field
/// provides the discriminant. Decoding peeks the `type` field and then
/// parses the concrete struct from the original bytes, which keeps
/// `RawValue` payloads byte-identical to what arrived on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Register(Register),
    Registered(Registered),
    Status(Status),
    CommandResult(CommandResult),
    Pong(Pong),
    Ping(Ping),
    Command(Command),
    Request(Request),
    ListInstances(ListInstances),
    SetDefault(SetDefault),
    Response(Response),
    Instances(Instances),
    Ack(Ack),
    Error(ErrorFrame),
}

impl Message {
    /// Parses one message from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(rename = "type")]
            kind: String,
        }

        let probe: Probe = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

        let kind = MessageType::from_str(&probe.kind)
            .ok_or(ProtocolError::UnknownMessageType(probe.kind))?;

        fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ProtocolError> {
            serde_json::from_slice(payload).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
        }

        Ok(match kind {
            MessageType::Register => Self::Register(parse(payload)?),
            MessageType::Registered => Self::Registered(parse(payload)?),
            MessageType::Status => Self::Status(parse(payload)?),
            MessageType::CommandResult => Self::CommandResult(parse(payload)?),
            MessageType::Pong => Self::Pong(parse(payload)?),
            MessageType::Ping => Self::Ping(parse(payload)?),
            MessageType::Command => Self::Command(parse(payload)?),
            MessageType::Request => Self::Request(parse(payload)?),
            MessageType::ListInstances => Self::ListInstances(parse(payload)?),
            MessageType::SetDefault => Self::SetDefault(parse(payload)?),
            MessageType::Response => Self::Response(parse(payload)?),
            MessageType::Instances => Self::Instances(parse(payload)?),
            MessageType::Ack => Self::Ack(parse(payload)?),
            MessageType::Error => Self::Error(parse(payload)?),
        })
    }

    /// Serialises this message to a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
    }

    /// Returns the discriminant of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Register(_) => MessageType::Register,
            Self::Registered(_) => MessageType::Registered,
            Self::Status(_) => MessageType::Status,
            Self::CommandResult(_) => MessageType::CommandResult,
            Self::Pong(_) => MessageType::Pong,
            Self::Ping(_) => MessageType::Ping,
            Self::Command(_) => MessageType::Command,
            Self::Request(_) => MessageType::Request,
            Self::ListInstances(_) => MessageType::ListInstances,
            Self::SetDefault(_) => MessageType::SetDefault,
            Self::Response(_) => MessageType::Response,
            Self::Instances(_) => MessageType::Instances,
            Self::Ack(_) => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_message! {
    Register => Register,
    Registered => Registered,
    Status => Status,
    CommandResult => CommandResult,
    Pong => Pong,
    Ping => Ping,
    Command => Command,
    Request => Request,
    ListInstances => ListInstances,
    SetDefault => SetDefault,
    Response => Response,
    Instances => Instances,
    Ack => Ack,
    Error => ErrorFrame,
}
