//! Tool server runtime — the peer side of the wire protocol.
//!
//! Answers handshake, list and call requests on a byte stream. Each call
//! runs on its own task, so responses may leave in a different order than
//! the requests arrived. A single writer task owns the output stream.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::rpc_client::errors::RpcError;
use crate::rpc_client::schema;
use crate::rpc_client::transport::{decode_frame, FrameReader, FrameWriter, Received};
use crate::rpc_client::types::{
    categories, CallRequest, CallResponse, ErrorPayload, HandshakeRequest, HandshakeResponse,
    Message, MessageKind, PeerInfo, ToolSpec, PROTOCOL_VERSION,
};

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Application-level failure reported by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{category}] {message}")]
pub struct ToolFailure {
    pub category: String,
    pub message: String,
}

impl ToolFailure {
    pub fn new(category: &str, message: impl Into<String>) -> Self {
        Self {
            category: category.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(categories::INVALID_ARGUMENTS, message)
    }
}

impl From<ToolFailure> for ErrorPayload {
    fn from(failure: ToolFailure) -> Self {
        Self {
            category: failure.category,
            message: failure.message,
        }
    }
}

/// A tool body: JSON argument object in, JSON result or failure out.
pub type ToolHandler = Arc<dyn Fn(Map<String, Value>) -> Result<Value, ToolFailure> + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

// ─── ToolServer ──────────────────────────────────────────────────────────────

/// A set of named tools served over the wire protocol.
pub struct ToolServer {
    info: PeerInfo,
    /// Tools in registration order.
    tools: Vec<RegisteredTool>,
    /// `tool_name → index into tools`.
    index: HashMap<String, usize>,
}

impl ToolServer {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            info: PeerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Register a tool. Re-registering a name replaces the earlier entry.
    pub fn register<F>(
        &mut self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Result<Value, ToolFailure> + Send + Sync + 'static,
    {
        let tool = RegisteredTool {
            spec: ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                input_schema,
            },
            handler: Arc::new(handler),
        };

        match self.index.get(name) {
            Some(&slot) => self.tools[slot] = tool,
            None => {
                self.index.insert(name.to_string(), self.tools.len());
                self.tools.push(tool);
            }
        }
        self
    }

    /// Catalog in registration order.
    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    /// Look up a tool and check its arguments.
    fn prepare(&self, request: &CallRequest) -> Result<ToolHandler, ToolFailure> {
        let tool = self
            .index
            .get(&request.tool)
            .and_then(|&slot| self.tools.get(slot))
            .ok_or_else(|| {
                ToolFailure::new(
                    categories::UNKNOWN_TOOL,
                    format!("unknown tool: '{}'", request.tool),
                )
            })?;

        let arguments = Value::Object(request.arguments.clone());
        schema::validate_arguments(&request.tool, &tool.spec.input_schema, &arguments).map_err(
            |e| match e {
                RpcError::SchemaValidation { reason, .. } => ToolFailure::invalid_arguments(reason),
                other => ToolFailure::invalid_arguments(other.to_string()),
            },
        )?;

        Ok(Arc::clone(&tool.handler))
    }

    /// Serve on this process's stdin/stdout until stdin closes.
    pub async fn serve_stdio(self) -> Result<(), RpcError> {
        tracing::info!(server = %self.info.name, tools = self.tools.len(), "serving on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve on arbitrary streams until the reader reaches end of stream.
    ///
    /// Returns once every in-flight call has been answered.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), RpcError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = self.info.name.clone();
        let server = Arc::new(self);
        let mut reader = FrameReader::new(&name, reader);
        let mut writer = FrameWriter::new(&name, writer);

        let (outbox, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let writer_name = name.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                if let Err(e) = writer.send(&message).await {
                    tracing::warn!(server = %writer_name, error = %e, "failed to write response");
                    return Err(e);
                }
            }
            writer.close().await;
            Ok(())
        });

        let mut initialized = false;
        let read_result = loop {
            let frame = match reader.receive().await {
                Ok(Received::Frame(frame)) => frame,
                Ok(Received::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            };

            let message = match decode_frame(&name, &frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "malformed frame");
                    let reply = Message::error(
                        recover_id(&frame),
                        categories::MALFORMED_MESSAGE,
                        e.to_string(),
                    );
                    let _ = outbox.send(reply);
                    continue;
                }
            };

            if let Some(reply) = server.handle(message, &mut initialized, &outbox) {
                let _ = outbox.send(reply);
            }
        };

        // The writer drains once every handler task drops its sender.
        drop(outbox);
        let write_result = match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(RpcError::Transport {
                server: name.clone(),
                reason: format!("writer task failed: {e}"),
            }),
        };

        tracing::debug!(server = %name, "stream closed");
        read_result.and(write_result)
    }

    /// Handle one message. Returns an immediate reply, if any; calls reply
    /// later through `outbox`.
    fn handle(
        self: &Arc<Self>,
        message: Message,
        initialized: &mut bool,
        outbox: &mpsc::UnboundedSender<Message>,
    ) -> Option<Message> {
        let id = message.id;
        match message.kind {
            MessageKind::HandshakeRequest => Some(self.handshake(message.payload, id, initialized)),
            MessageKind::ListRequest | MessageKind::CallRequest if !*initialized => {
                Some(Message::error(
                    id,
                    categories::NOT_INITIALIZED,
                    "handshake required before any request",
                ))
            }
            MessageKind::ListRequest | MessageKind::CallRequest if id.is_none() => Some(
                Message::error(None, categories::MALFORMED_MESSAGE, "request is missing an id"),
            ),
            MessageKind::ListRequest => {
                let catalog = serde_json::to_value(self.catalog()).unwrap_or_default();
                Some(Message {
                    kind: MessageKind::ListResponse,
                    id,
                    payload: catalog,
                })
            }
            MessageKind::CallRequest => {
                match serde_json::from_value::<CallRequest>(message.payload) {
                    Ok(request) => {
                        self.spawn_call(request, id, outbox.clone());
                        None
                    }
                    Err(e) => Some(Message::error(
                        id,
                        categories::MALFORMED_MESSAGE,
                        format!("malformed call-request: {e}"),
                    )),
                }
            }
            other => Some(Message::error(
                id,
                categories::UNEXPECTED_KIND,
                format!("unexpected {other:?} sent to server"),
            )),
        }
    }

    fn handshake(&self, payload: Value, id: Option<u64>, initialized: &mut bool) -> Message {
        let request: HandshakeRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                return Message::error(
                    id,
                    categories::MALFORMED_MESSAGE,
                    format!("malformed handshake-request: {e}"),
                );
            }
        };

        if request.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.info.name,
                requested = %request.protocol_version,
                "unsupported protocol version"
            );
            return Message::error(
                id,
                categories::UNSUPPORTED_VERSION,
                format!(
                    "protocol version '{}' is not supported (expected '{PROTOCOL_VERSION}')",
                    request.protocol_version
                ),
            );
        }

        *initialized = true;
        tracing::debug!(
            server = %self.info.name,
            client = %request.client.name,
            client_version = %request.client.version,
            "handshake accepted"
        );

        let response = HandshakeResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server: self.info.clone(),
            capabilities: serde_json::json!({"tools": {}}),
        };
        Message {
            kind: MessageKind::HandshakeResponse,
            id,
            payload: serde_json::to_value(response).unwrap_or_default(),
        }
    }

    /// Run one call on its own task and queue the response.
    fn spawn_call(
        self: &Arc<Self>,
        request: CallRequest,
        id: Option<u64>,
        outbox: mpsc::UnboundedSender<Message>,
    ) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let tool = request.tool.clone();
            let outcome = match server.prepare(&request) {
                Ok(handler) => {
                    let arguments = request.arguments;
                    match tokio::task::spawn_blocking(move || handler(arguments)).await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!(server = %server.info.name, tool = %tool, error = %e, "tool handler panicked");
                            Err(ToolFailure::new(
                                categories::INTERNAL,
                                format!("tool '{tool}' failed unexpectedly"),
                            ))
                        }
                    }
                }
                Err(failure) => Err(failure),
            };

            let response = match outcome {
                Ok(value) => CallResponse::Result(value),
                Err(failure) => {
                    tracing::debug!(server = %server.info.name, tool = %tool, error = %failure, "call failed");
                    CallResponse::Error(failure.into())
                }
            };
            let payload = serde_json::to_value(response).unwrap_or_default();
            let _ = outbox.send(Message {
                kind: MessageKind::CallResponse,
                id,
                payload,
            });
        });
    }
}

/// Best-effort recovery of the id of a frame that failed to decode.
fn recover_id(frame: &[u8]) -> Option<u64> {
    serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_u64))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
