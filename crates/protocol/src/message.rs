//! Protocol message types.
//!
//! One externally-tagged enum covers every message on the wire. Arguments
//! and results are arbitrary [`serde_json::Value`]s; binary payloads are
//! embedded as base64 via [`crate::Blob`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Client → Server: first message on a connection.
    Hello {
        protocol_version: u32,
        client_name: String,
        client_version: String,
    },

    /// Server → Client: handshake accepted.
    Welcome {
        protocol_version: u32,
        server_version: String,
        session_id: String,
    },

    /// Client → Server: invoke a tool.
    Request {
        /// Correlation id, unique among in-flight calls on this connection.
        id: String,
        tool: String,
        args: Value,
    },

    /// Server → Client: outcome of a request with the same `id`.
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Client → Server: ask to cancel an in-flight call. Idempotent —
    /// a notice for an unknown or completed id is a no-op.
    CancelNotice { id: String },

    /// Client → Server: list the registered tools.
    DiscoveryRequest,

    /// Server → Client: tool listing, in registration order.
    DiscoveryResponse { tools: Vec<ToolSummary> },

    /// Bidirectional: heartbeat.
    Ping { timestamp: i64 },

    /// Bidirectional: heartbeat response.
    Pong { timestamp: i64 },
}

impl WireMessage {
    /// Build a successful response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        WireMessage::Response {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failed response.
    pub fn failure(id: impl Into<String>, error: WireError) -> Self {
        WireMessage::Response {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// A tool as advertised in `discovery_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
}

/// Error classification carried in a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No tool registered under the requested name.
    UnknownTool,
    /// Arguments do not conform to the tool's input schema.
    Validation,
    /// The handler faulted; `message` carries the original fault text.
    Handler,
    /// The handler's result violated its declared output schema.
    Contract,
    /// The call exceeded its wall-clock budget.
    Timeout,
    /// The call was cancelled before completing.
    Cancelled,
    /// The peer violated the wire protocol.
    Protocol,
    /// The connection went away before a response arrived.
    ConnectionClosed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::Validation => "validation",
            ErrorKind::Handler => "handler",
            ErrorKind::Contract => "contract",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::ConnectionClosed => "connection_closed",
        };
        f.write_str(s)
    }
}

/// Structured error payload of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    /// Instance path of the offending field for `validation` errors,
    /// e.g. `"/ticker"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
        }
    }

    /// A `validation` error pointing at the offending field.
    pub fn validation(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
            path: Some(path.into()),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} at {}: {}", self.kind, path, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for WireError {}
