//! Shared types for the RPC client and the tool server.
//!
//! Wire message envelope, per-kind payloads, and the descriptors the
//! orchestrator keeps for servers and tools.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Protocol version spoken by both sides of a session.
pub const PROTOCOL_VERSION: &str = "1.0";

// ─── Wire Envelope ───────────────────────────────────────────────────────────

/// Discriminates the payload carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    HandshakeRequest,
    HandshakeResponse,
    ListRequest,
    ListResponse,
    CallRequest,
    CallResponse,
    Error,
}

/// One line of the wire protocol.
///
/// `id` is absent only on the one-shot handshake pair (and on `error`
/// replies to frames whose id could not be recovered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Create a message carrying a correlation id.
    pub fn new(kind: MessageKind, id: u64, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: Some(id),
            payload,
        }
    }

    /// Create a message without a correlation id.
    pub fn one_shot(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: None,
            payload,
        }
    }

    /// Build an `error` reply.
    pub fn error(id: Option<u64>, category: &str, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            category: category.to_string(),
            message: message.into(),
        };
        Self {
            kind: MessageKind::Error,
            id,
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Name and version of one side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Payload of `handshake-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub protocol_version: String,
    pub client: PeerInfo,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// Payload of `handshake-response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub protocol_version: String,
    pub server: PeerInfo,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

/// One catalog entry of `list-response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Payload of `call-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Payload of `call-response`: a result or an application-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallResponse {
    Result(serde_json::Value),
    Error(ErrorPayload),
}

/// Payload of `error` messages and of failed `call-response`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub category: String,
    pub message: String,
}

/// Well-known error categories.
pub mod categories {
    /// The frame was not a valid message.
    pub const MALFORMED_MESSAGE: &str = "malformed-message";
    /// A request arrived before the handshake.
    pub const NOT_INITIALIZED: &str = "not-initialized";
    /// The handshake asked for a protocol version the peer does not speak.
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
    /// The message kind is not valid in this direction.
    pub const UNEXPECTED_KIND: &str = "unexpected-kind";
    /// The requested tool is not served by this peer.
    pub const UNKNOWN_TOOL: &str = "unknown-tool";
    /// Arguments failed the tool's input schema.
    pub const INVALID_ARGUMENTS: &str = "invalid-arguments";
    /// The handler failed unexpectedly.
    pub const INTERNAL: &str = "internal";
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// How to start one tool-providing server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerDescriptor {
    /// Create a descriptor with no environment overrides.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Add one environment override.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// A discovered tool and the server that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub server: String,
}

impl ToolDescriptor {
    /// Attach a catalog entry to its owning server.
    pub fn from_spec(spec: ToolSpec, server: &str) -> Self {
        Self {
            name: spec.name,
            description: spec.description,
            input_schema: spec.input_schema,
            server: server.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
