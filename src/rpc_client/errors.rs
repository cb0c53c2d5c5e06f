//! RPC client error types.

use thiserror::Error;

/// Errors that can occur during orchestration, session, and registry operations.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// A server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    Spawn {
        server: String,
        reason: String,
    },

    /// The handshake was malformed, rejected, or timed out.
    #[error("handshake with server '{server}' failed: {reason}")]
    Handshake {
        server: String,
        reason: String,
    },

    /// The peer sent a malformed or out-of-protocol message.
    #[error("protocol error from server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// Broken pipe, closed stream, or other I/O failure on the channel.
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// No response arrived within the deadline.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The peer reported an application-level failure for a tool call.
    #[error("tool '{tool}' failed [{category}]: {message}")]
    ToolExecution {
        tool: String,
        category: String,
        message: String,
    },

    /// Tool not present in the registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Two servers declare the same tool name.
    #[error("tool '{name}' from server '{server}' is already provided by '{existing_server}'")]
    DuplicateTool {
        name: String,
        server: String,
        existing_server: String,
    },

    /// A server with this name is already registered.
    #[error("server '{name}' is already registered")]
    DuplicateServer {
        name: String,
    },

    /// No server with this name is registered.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The session is not in the `Ready` state.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// The operation is not valid in the session's current state.
    #[error("server '{server}' cannot {operation} while {state}")]
    InvalidState {
        server: String,
        operation: String,
        state: String,
    },

    /// A pending request was invalidated by a disconnect.
    #[error("request to server '{server}' cancelled by disconnect")]
    Cancelled {
        server: String,
    },

    /// Tool arguments do not match the tool's input schema.
    #[error("invalid arguments for '{tool}': {reason}")]
    SchemaValidation {
        tool: String,
        reason: String,
    },

    /// Configuration error (bad config file, duplicate entries).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },

    /// One or more servers failed during `connect_all`.
    #[error("{} server(s) failed to connect: {}", .failures.len(), failed_names(.failures))]
    ConnectFailed {
        failures: Vec<(String, RpcError)>,
    },

    /// A server could not be shut down cleanly.
    #[error("shutdown of server '{server}' failed: {reason}")]
    Shutdown {
        server: String,
        reason: String,
    },
}

fn failed_names(failures: &[(String, RpcError)]) -> String {
    failures
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RpcError {
    /// Caller usage errors, detected locally without any I/O.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTool { .. }
                | Self::DuplicateTool { .. }
                | Self::DuplicateServer { .. }
                | Self::UnknownServer { .. }
                | Self::NotConnected { .. }
                | Self::InvalidState { .. }
                | Self::SchemaValidation { .. }
        )
    }

    /// Errors after which the session that produced them is no longer usable.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::Handshake { .. }
                | Self::Protocol { .. }
                | Self::Transport { .. }
                | Self::Cancelled { .. }
        )
    }
}
