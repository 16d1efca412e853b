//! JSON-RPC 2.0 envelope types used by the bridge.
//!
//! The bridge never interprets relayed messages. It only needs:
//!
//! - **Error envelopes** for the failures it reports itself (a message posted
//!   to a session that does not exist, a body that is not JSON)
//! - **Summaries** of relayed frames (kind, method, id) for diagnostic logging
//!
//! # Message Kinds
//!
//! - **Request**: has `method` and `id`
//! - **Notification**: has `method`, no `id`
//! - **Response**: has `id` and either `result` or `error`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The MCP protocol version reported by the health endpoint.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Server-defined error code used when a message targets no open session.
pub const SESSION_NOT_ESTABLISHED_CODE: i32 = -32000;

/// A JSON-RPC 2.0 request ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request ID.
    Number(i64),
    /// String request ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Standard JSON-RPC 2.0 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// Internal JSON-RPC error.
    InternalError,
    /// Server-defined error.
    ServerError(i32),
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::InternalError => -32603,
            Self::ServerError(code) => code,
        }
    }

    /// Returns the default message for this error code.
    #[must_use]
    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::InternalError => "Internal error",
            Self::ServerError(_) => "Server error",
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// The error code.
    pub code: i32,

    /// A short description of the error.
    pub message: String,

    /// Additional information about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates a new error from an error code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.default_message().to_string(),
            data: None,
        }
    }

    /// Creates a new error with a custom message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Adds additional data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A JSON-RPC 2.0 error response.
///
/// `id` is serialised as `null` when unknown, as JSON-RPC requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Always "2.0".
    pub jsonrpc: String,

    /// The error details.
    pub error: JsonRpcErrorData,

    /// The request ID this error corresponds to (if known).
    pub id: Option<RequestId>,
}

impl JsonRpcError {
    /// Creates a new error response.
    #[must_use]
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            error,
            id,
        }
    }

    /// Creates a parse error response (ID cannot be determined).
    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(None, JsonRpcErrorData::from_code(ErrorCode::ParseError))
    }

    /// Creates the error returned for a message over the size limit.
    #[must_use]
    pub fn message_too_large(limit: usize) -> Self {
        Self::new(
            None,
            JsonRpcErrorData::with_message(ErrorCode::InvalidRequest, "Message too large")
                .with_data(serde_json::json!({ "limit": limit })),
        )
    }

    /// Creates the error returned when a message targets no open session.
    #[must_use]
    pub fn session_not_established() -> Self {
        Self::new(
            None,
            JsonRpcErrorData::with_message(
                ErrorCode::ServerError(SESSION_NOT_ESTABLISHED_CODE),
                "Session not established",
            ),
        )
    }

    /// Creates an internal error response.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(
            None,
            JsonRpcErrorData::with_message(ErrorCode::InternalError, message),
        )
    }
}

/// What kind of JSON-RPC message a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Has a method and an id.
    Request,
    /// Has a method and no id.
    Notification,
    /// Has an id and no method.
    Response,
    /// A JSON-RPC batch (top-level array).
    Batch,
}

/// Routing-relevant fields of a relayed message, for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeSummary {
    /// Message kind.
    pub kind: MessageKind,
    /// Method name, for requests and notifications.
    pub method: Option<String>,
    /// Request ID, for requests and responses.
    pub id: Option<RequestId>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
}

/// Extracts kind, method and id from a frame.
///
/// Returns `None` for anything that is not a JSON object or array; the
/// bridge relays such frames unchanged and leaves the backend to reject them.
#[must_use]
pub fn summarize(frame: &str) -> Option<EnvelopeSummary> {
    let trimmed = frame.trim_start();
    if trimmed.starts_with('[') {
        return Some(EnvelopeSummary {
            kind: MessageKind::Batch,
            method: None,
            id: None,
        });
    }

    let raw: RawEnvelope = serde_json::from_str(trimmed).ok()?;
    let kind = match (&raw.method, &raw.id) {
        (Some(_), Some(_)) => MessageKind::Request,
        (Some(_), None) => MessageKind::Notification,
        (None, _) => MessageKind::Response,
    };

    Some(EnvelopeSummary {
        kind,
        method: raw.method,
        id: raw.id,
    })
}
