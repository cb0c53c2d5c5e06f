//! RPC session — one client-side connection to one tool server.
//!
//! A session owns its transport channel, performs the handshake and catalog
//! fetch, and correlates responses to in-flight requests by id. A background
//! reader task routes every incoming frame to the caller waiting on it, so
//! responses may arrive in any order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::RpcError;
use super::transport::{Channel, ChildProcess, FrameReader, FrameWriter};
use super::types::{
    CallRequest, CallResponse, ErrorPayload, HandshakeRequest, HandshakeResponse, Message,
    MessageKind, PeerInfo, ServerDescriptor, ToolDescriptor, ToolSpec, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single request.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Timeouts in a row after which the peer is considered dead.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

// ─── State ───────────────────────────────────────────────────────────────────

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Timeouts and identity used by a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_consecutive_timeouts: u32,
    pub client_info: PeerInfo,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            call_timeout: CALL_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
            max_consecutive_timeouts: MAX_CONSECUTIVE_TIMEOUTS,
            client_info: PeerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

type Reply = Result<Message, RpcError>;

/// State shared between the session handle and its reader task.
struct Shared {
    server: String,
    state: watch::Sender<SessionState>,
    /// `request id → waiting caller`.
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    writer: Mutex<Option<FrameWriter>>,
    process: Mutex<Option<ChildProcess>>,
    shutdown_grace: Duration,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Close the session, failing every pending request with `reason`.
    ///
    /// Only the first caller does the work; later calls get `None`.
    async fn close(&self, reason: &RpcError) -> Option<Result<(), RpcError>> {
        // Closing must be visible before the drain so no request can
        // register after it.
        let began = self.state.send_if_modified(|state| match state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        });
        if !began {
            return None;
        }

        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            tracing::debug!(
                server = %self.server,
                count = drained.len(),
                reason = %reason,
                "failing pending requests"
            );
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(reason.clone()));
        }

        self.release_writer().await;
        let process = self.process.lock().await.take();
        let result = match process {
            Some(process) => process.terminate(self.shutdown_grace).await,
            None => Ok(()),
        };

        self.state.send_replace(SessionState::Closed);
        tracing::info!(server = %self.server, "session closed");
        Some(result)
    }

    /// Take and close the writer, unless a send still holds it. That sender
    /// releases it once its own write finishes or times out.
    async fn release_writer(&self) {
        let writer = match self.writer.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                tracing::debug!(server = %self.server, "writer busy; left to the sender");
                return;
            }
        };
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.shutdown_grace, writer.close()).await;
        }
    }

    fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Route one incoming message to the request waiting on its id.
    ///
    /// Returns an error only for out-of-protocol messages.
    async fn dispatch(&self, message: Message) -> Result<(), RpcError> {
        match message.kind {
            MessageKind::ListResponse | MessageKind::CallResponse | MessageKind::Error => {}
            other => {
                return Err(RpcError::Protocol {
                    server: self.server.clone(),
                    reason: format!("unexpected {other:?} from server"),
                });
            }
        }

        let Some(id) = message.id else {
            tracing::warn!(
                server = %self.server,
                kind = ?message.kind,
                payload = %message.payload,
                "dropping message without correlation id"
            );
            return Ok(());
        };

        let waiter = self.pending.lock().await.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(message));
            }
            None => {
                tracing::warn!(
                    server = %self.server,
                    id,
                    kind = ?message.kind,
                    "dropping response with unmatched id"
                );
            }
        }
        Ok(())
    }
}

/// Reader task: pull frames off the channel until it closes.
async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    loop {
        let outcome = match reader.receive_message().await {
            Ok(Some(message)) => shared.dispatch(message).await,
            Ok(None) => Err(RpcError::Transport {
                server: shared.server.clone(),
                reason: "server closed the stream".into(),
            }),
            Err(e) => Err(e),
        };

        if let Err(reason) = outcome {
            if !shared.is_closing() {
                tracing::warn!(server = %shared.server, error = %reason, "session lost");
            }
            if let Some(Err(e)) = shared.close(&reason).await {
                tracing::warn!(server = %shared.server, error = %e, "error while closing session");
            }
            return;
        }
    }
}

// ─── RpcSession ──────────────────────────────────────────────────────────────

/// A client-side connection to one tool server.
pub struct RpcSession {
    descriptor: ServerDescriptor,
    options: SessionOptions,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    consecutive_timeouts: AtomicU32,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    peer: OnceLock<PeerInfo>,
}

impl RpcSession {
    /// Create a session in the `Disconnected` state. No I/O is performed.
    pub fn new(descriptor: ServerDescriptor, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let shared = Arc::new(Shared {
            server: descriptor.name.clone(),
            state,
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            process: Mutex::new(None),
            shutdown_grace: options.shutdown_grace,
        });
        Self {
            descriptor,
            options,
            shared,
            next_id: AtomicU64::new(1),
            consecutive_timeouts: AtomicU32::new(0),
            reader_task: std::sync::Mutex::new(None),
            peer: OnceLock::new(),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    /// Server name (unique key).
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Server identity reported in the handshake.
    pub fn peer_info(&self) -> Option<&PeerInfo> {
        self.peer.get()
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server, perform the handshake, and fetch its catalog.
    pub async fn connect(&self) -> Result<Vec<ToolDescriptor>, RpcError> {
        self.begin_connect()?;

        let channel = match Channel::spawn(&self.descriptor) {
            Ok(channel) => channel,
            Err(e) => {
                self.shared.state.send_replace(SessionState::Closed);
                return Err(e);
            }
        };

        self.establish(channel).await
    }

    /// Like [`connect`](Self::connect), over an already-open channel.
    pub async fn attach(&self, channel: Channel) -> Result<Vec<ToolDescriptor>, RpcError> {
        self.begin_connect()?;
        self.establish(channel).await
    }

    /// Close the session. Safe from any state; a second call is a no-op.
    ///
    /// Every pending request fails with [`RpcError::Cancelled`].
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        let reason = self.cancelled();
        self.shutdown(&reason).await
    }

    fn cancelled(&self) -> RpcError {
        RpcError::Cancelled {
            server: self.name().to_string(),
        }
    }

    fn begin_connect(&self) -> Result<(), RpcError> {
        let mut observed = SessionState::Disconnected;
        let began = self.shared.state.send_if_modified(|state| {
            observed = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if began {
            tracing::debug!(server = %self.name(), "connecting");
            Ok(())
        } else {
            Err(RpcError::InvalidState {
                server: self.name().to_string(),
                operation: "connect".into(),
                state: observed.to_string(),
            })
        }
    }

    async fn establish(&self, channel: Channel) -> Result<Vec<ToolDescriptor>, RpcError> {
        let Channel {
            mut reader,
            mut writer,
            mut process,
        } = channel;

        let timeout = self.options.handshake_timeout;
        let mut states = self.subscribe();
        let disconnected = async move {
            let _ = states
                .wait_for(|state| matches!(state, SessionState::Closing | SessionState::Closed))
                .await;
        };
        let handshake = tokio::select! {
            result = tokio::time::timeout(timeout, self.handshake(&mut reader, &mut writer)) => {
                Some(result)
            }
            () = disconnected => None,
        };
        let peer = match handshake {
            Some(Ok(Ok(peer))) => peer,
            Some(Ok(Err(e))) => return Err(self.abort_connect(Some(writer), process, e).await),
            Some(Err(_)) => {
                let e = RpcError::Handshake {
                    server: self.name().to_string(),
                    reason: format!("timed out after {}ms", millis(timeout)),
                };
                return Err(self.abort_connect(Some(writer), process, e).await);
            }
            None => {
                let e = self.cancelled();
                return Err(self.abort_connect(Some(writer), process, e).await);
            }
        };

        if let Some(process) = process.as_mut() {
            process.forward_stderr();
        }
        *self.shared.writer.lock().await = Some(writer);
        *self.shared.process.lock().await = process;

        // A disconnect that ran before the channel was stored found nothing
        // to close; whatever it left behind is closed here.
        if self.shared.is_closing() {
            let writer = self.shared.writer.lock().await.take();
            let process = self.shared.process.lock().await.take();
            let e = self.cancelled();
            return Err(self.abort_connect(writer, process, e).await);
        }

        let task = tokio::spawn(read_loop(Arc::clone(&self.shared), reader));
        if let Ok(mut slot) = self.reader_task.lock() {
            *slot = Some(task);
        }

        tracing::debug!(
            server = %self.name(),
            peer = %peer.name,
            peer_version = %peer.version,
            "handshake complete"
        );
        let _ = self.peer.set(peer);

        let tools = match self.fetch_catalog().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = self.shutdown(&e).await {
                    tracing::warn!(server = %self.name(), error = %close_err, "error while closing session");
                }
                return Err(e);
            }
        };

        let became_ready = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !became_ready {
            return Err(self.cancelled());
        }

        tracing::info!(
            server = %self.name(),
            tools = tools.len(),
            "session ready"
        );
        Ok(tools)
    }

    async fn handshake(
        &self,
        reader: &mut FrameReader,
        writer: &mut FrameWriter,
    ) -> Result<PeerInfo, RpcError> {
        let handshake_err = |reason: String| RpcError::Handshake {
            server: self.name().to_string(),
            reason,
        };

        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client: self.options.client_info.clone(),
            capabilities: serde_json::json!({}),
        };
        let payload = serde_json::to_value(request)
            .map_err(|e| handshake_err(format!("failed to serialize handshake: {e}")))?;

        writer
            .send(&Message::one_shot(MessageKind::HandshakeRequest, payload))
            .await
            .map_err(|e| handshake_err(e.to_string()))?;

        let message = reader
            .receive_message()
            .await
            .map_err(|e| handshake_err(e.to_string()))?
            .ok_or_else(|| handshake_err("server closed the stream before responding".into()))?;

        match message.kind {
            MessageKind::HandshakeResponse => {
                let response: HandshakeResponse = serde_json::from_value(message.payload)
                    .map_err(|e| handshake_err(format!("malformed handshake-response: {e}")))?;
                if response.protocol_version != PROTOCOL_VERSION {
                    return Err(handshake_err(format!(
                        "unsupported protocol version '{}' (expected '{PROTOCOL_VERSION}')",
                        response.protocol_version
                    )));
                }
                Ok(response.server)
            }
            MessageKind::Error => {
                let err = error_payload(message.payload);
                Err(handshake_err(format!(
                    "server rejected handshake [{}]: {}",
                    err.category, err.message
                )))
            }
            other => Err(handshake_err(format!(
                "expected handshake-response, got {other:?}"
            ))),
        }
    }

    /// Tear down a half-open channel after a failed or cancelled handshake.
    async fn abort_connect(
        &self,
        writer: Option<FrameWriter>,
        process: Option<ChildProcess>,
        error: RpcError,
    ) -> RpcError {
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(self.options.shutdown_grace, writer.close()).await;
        }
        let mut error = error;

        if let Some(mut process) = process {
            process.start_kill();
            let stderr = process.capture_stderr().await;
            if !stderr.is_empty() {
                tracing::warn!(
                    server = %self.name(),
                    stderr = %stderr,
                    "server stderr captured on failure"
                );
                if let RpcError::Handshake { reason, .. } = &mut error {
                    reason.push_str(&format!(" | stderr: {stderr}"));
                }
            }
            if let Err(e) = process.terminate(self.options.shutdown_grace).await {
                tracing::warn!(server = %self.name(), error = %e, "failed to reap server");
            }
        }

        self.shared.state.send_replace(SessionState::Closed);
        tracing::warn!(server = %self.name(), error = %error, "connect failed");
        error
    }

    async fn shutdown(&self, reason: &RpcError) -> Result<(), RpcError> {
        match self.shared.close(reason).await {
            Some(result) => {
                let task = self.reader_task.lock().ok().and_then(|mut slot| slot.take());
                if let Some(task) = task {
                    task.abort();
                }
                result
            }
            None => {
                // Another path is closing; wait for it to finish.
                let mut states = self.subscribe();
                let closed = states.wait_for(|state| *state == SessionState::Closed);
                let _ = tokio::time::timeout(self.options.shutdown_grace * 2, closed).await;
                Ok(())
            }
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn ensure_ready(&self) -> Result<(), RpcError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(RpcError::NotConnected {
                server: self.name().to_string(),
            })
        }
    }

    /// Fetch the peer's current tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, RpcError> {
        self.ensure_ready()?;
        match self.fetch_catalog().await {
            Err(e @ RpcError::Protocol { .. }) => {
                let _ = self.shutdown(&e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn fetch_catalog(&self) -> Result<Vec<ToolDescriptor>, RpcError> {
        let reply = self
            .request(MessageKind::ListRequest, serde_json::Value::Null, "list tools")
            .await?;

        match reply.kind {
            MessageKind::ListResponse => {
                let specs: Vec<ToolSpec> =
                    serde_json::from_value(reply.payload).map_err(|e| RpcError::Protocol {
                        server: self.name().to_string(),
                        reason: format!("malformed list-response: {e}"),
                    })?;
                Ok(specs
                    .into_iter()
                    .map(|spec| ToolDescriptor::from_spec(spec, self.name()))
                    .collect())
            }
            MessageKind::Error => {
                let err = error_payload(reply.payload);
                Err(RpcError::Protocol {
                    server: self.name().to_string(),
                    reason: format!("list request rejected [{}]: {}", err.category, err.message),
                })
            }
            other => Err(RpcError::Protocol {
                server: self.name().to_string(),
                reason: format!("expected list-response, got {other:?}"),
            }),
        }
    }

    /// Invoke `tool` on the peer and wait for its result.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, RpcError> {
        self.ensure_ready()?;

        let payload = serde_json::to_value(CallRequest {
            tool: tool.to_string(),
            arguments,
        })
        .map_err(|e| RpcError::Transport {
            server: self.name().to_string(),
            reason: format!("failed to serialize call: {e}"),
        })?;

        let reply = self
            .request(MessageKind::CallRequest, payload, &format!("call '{tool}'"))
            .await?;

        match reply.kind {
            MessageKind::CallResponse => match serde_json::from_value::<CallResponse>(reply.payload)
            {
                Ok(CallResponse::Result(value)) => Ok(value),
                Ok(CallResponse::Error(err)) => Err(RpcError::ToolExecution {
                    tool: tool.to_string(),
                    category: err.category,
                    message: err.message,
                }),
                Err(e) => {
                    let err = RpcError::Protocol {
                        server: self.name().to_string(),
                        reason: format!("malformed call-response: {e}"),
                    };
                    let _ = self.shutdown(&err).await;
                    Err(err)
                }
            },
            MessageKind::Error => {
                let err = error_payload(reply.payload);
                Err(RpcError::ToolExecution {
                    tool: tool.to_string(),
                    category: err.category,
                    message: err.message,
                })
            }
            other => {
                let err = RpcError::Protocol {
                    server: self.name().to_string(),
                    reason: format!("expected call-response, got {other:?}"),
                };
                let _ = self.shutdown(&err).await;
                Err(err)
            }
        }
    }

    /// Send one request and wait for the response with the same id.
    async fn request(
        &self,
        kind: MessageKind,
        payload: serde_json::Value,
        operation: &str,
    ) -> Result<Message, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().await;
            match self.state() {
                SessionState::Connecting | SessionState::Ready => {
                    pending.insert(id, tx);
                }
                _ => {
                    return Err(RpcError::NotConnected {
                        server: self.name().to_string(),
                    });
                }
            }
        }

        let message = Message::new(kind, id, payload);
        let timeout = self.options.call_timeout;
        let timed_out = || RpcError::Timeout {
            server: self.name().to_string(),
            operation: operation.to_string(),
            timeout_ms: millis(timeout),
        };

        // The write shares the call deadline: a peer that stops reading
        // fills the pipe and would otherwise block here forever.
        let send = async {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => writer.send(&message).await,
                None => Err(RpcError::NotConnected {
                    server: self.name().to_string(),
                }),
            }
        };
        let sent = tokio::time::timeout(timeout, send).await;

        if self.shared.is_closing() {
            // A close that found the writer busy left it to us.
            self.shared.release_writer().await;
        }
        if !matches!(sent, Ok(Ok(()))) {
            self.shared.pending.lock().await.remove(&id);
            // Closed while the write was blocked; report why.
            if let Ok(Err(reason)) = rx.try_recv() {
                return Err(reason);
            }
        }
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if matches!(e, RpcError::Transport { .. }) {
                    let _ = self.shutdown(&e).await;
                }
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(server = %self.name(), id, "write stalled; closing session");
                let dead = RpcError::Transport {
                    server: self.name().to_string(),
                    reason: format!("write blocked for {}ms", millis(timeout)),
                };
                let _ = self.shutdown(&dead).await;
                return Err(timed_out());
            }
        }

        tracing::debug!(server = %self.name(), id, kind = ?kind, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                reply
            }
            Ok(Err(_)) => Err(self.cancelled()),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                let err = timed_out();
                tracing::warn!(server = %self.name(), id, timeouts, "request timed out");

                if timeouts >= self.options.max_consecutive_timeouts {
                    let dead = RpcError::Transport {
                        server: self.name().to_string(),
                        reason: format!("unresponsive after {timeouts} consecutive timeouts"),
                    };
                    let _ = self.shutdown(&dead).await;
                }
                Err(err)
            }
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parse an error payload, keeping the raw value if it does not fit.
fn error_payload(payload: serde_json::Value) -> ErrorPayload {
    serde_json::from_value(payload.clone()).unwrap_or_else(|_| ErrorPayload {
        category: "unknown".into(),
        message: payload.to_string(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_client::transport::Received;
    use serde_json::json;

    /// The server side of an in-memory session.
    struct FakePeer {
        reader: FrameReader,
        writer: FrameWriter,
    }

    impl FakePeer {
        async fn expect(&mut self, kind: MessageKind) -> Message {
            let message = self.reader.receive_message().await.unwrap().unwrap();
            assert_eq!(message.kind, kind);
            message
        }

        async fn reply(&mut self, kind: MessageKind, id: u64, payload: serde_json::Value) {
            self.writer.send(&Message::new(kind, id, payload)).await.unwrap();
        }

        async fn result(&mut self, id: u64, value: serde_json::Value) {
            self.reply(MessageKind::CallResponse, id, json!({"result": value}))
                .await;
        }
    }

    fn test_options() -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(100),
            ..SessionOptions::default()
        }
    }

    fn pipe() -> (Channel, FakePeer) {
        pipe_with_capacity(16 * 1024)
    }

    fn pipe_with_capacity(capacity: usize) -> (Channel, FakePeer) {
        let (client, server) = tokio::io::duplex(capacity);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let channel = Channel::from_streams("fake", client_read, client_write);
        let peer = FakePeer {
            reader: FrameReader::new("peer", server_read),
            writer: FrameWriter::new("peer", server_write),
        };
        (channel, peer)
    }

    fn catalog() -> serde_json::Value {
        json!([{
            "name": "add",
            "description": "Add two integers",
            "inputSchema": {"type": "object", "required": ["a", "b"]}
        }])
    }

    async fn ready_session(options: SessionOptions) -> (Arc<RpcSession>, FakePeer) {
        ready_session_over(pipe(), options).await
    }

    async fn ready_session_over(
        (channel, mut peer): (Channel, FakePeer),
        options: SessionOptions,
    ) -> (Arc<RpcSession>, FakePeer) {
        let session = Arc::new(RpcSession::new(
            ServerDescriptor::new("fake", "unused", &[]),
            options,
        ));

        let peer_side = async {
            let hello = peer.expect(MessageKind::HandshakeRequest).await;
            assert!(hello.id.is_none());
            assert_eq!(hello.payload["protocolVersion"], PROTOCOL_VERSION);
            peer.writer
                .send(&Message::one_shot(
                    MessageKind::HandshakeResponse,
                    json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "server": {"name": "fake-server", "version": "0.1"},
                        "capabilities": {"tools": {}}
                    }),
                ))
                .await
                .unwrap();
            let list = peer.expect(MessageKind::ListRequest).await;
            peer.reply(MessageKind::ListResponse, list.id.unwrap(), catalog())
                .await;
        };

        let (tools, ()) = tokio::join!(session.attach(channel), peer_side);
        let tools = tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].server, "fake");
        (session, peer)
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_connect_reaches_ready_with_catalog() {
        let (session, _peer) = ready_session(test_options()).await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.peer_info().unwrap().name, "fake-server");
    }

    #[tokio::test]
    async fn test_call_tool_round_trip() {
        let (session, mut peer) = ready_session(test_options()).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 5, "b": 3}))).await }
        });

        let request = peer.expect(MessageKind::CallRequest).await;
        assert_eq!(request.payload["tool"], "add");
        assert_eq!(request.payload["arguments"]["a"], 5);
        peer.result(request.id.unwrap(), json!(8)).await;

        assert_eq!(call.await.unwrap().unwrap(), json!(8));
    }

    #[tokio::test]
    async fn test_mismatched_id_does_not_resolve_call() {
        let (session, mut peer) = ready_session(test_options()).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 1, "b": 1}))).await }
        });

        let request = peer.expect(MessageKind::CallRequest).await;
        let id = request.id.unwrap();
        peer.result(id + 100, json!("wrong")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());
        assert_eq!(session.pending_count().await, 1);

        peer.result(id, json!(2)).await;
        assert_eq!(call.await.unwrap().unwrap(), json!(2));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (session, mut peer) = ready_session(test_options()).await;

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 1, "b": 0}))).await }
        });
        let first_req = peer.expect(MessageKind::CallRequest).await;

        let second = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 2, "b": 0}))).await }
        });
        let second_req = peer.expect(MessageKind::CallRequest).await;
        assert!(second_req.id.unwrap() > first_req.id.unwrap());

        peer.result(second_req.id.unwrap(), json!("second")).await;
        peer.result(first_req.id.unwrap(), json!("first")).await;

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_all_pending() {
        let (session, mut peer) = ready_session(test_options()).await;

        let mut calls = Vec::new();
        for n in 0..3 {
            let session = Arc::clone(&session);
            calls.push(tokio::spawn(async move {
                session.call_tool("add", args(json!({"a": n, "b": n}))).await
            }));
            peer.expect(MessageKind::CallRequest).await;
        }
        assert_eq!(session.pending_count().await, 3);

        session.disconnect().await.unwrap();

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::Cancelled { .. }), "got {err:?}");
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, _peer) = ready_session(test_options()).await;
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let session = RpcSession::new(ServerDescriptor::new("idle", "unused", &[]), test_options());
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_connected() {
        let session = RpcSession::new(ServerDescriptor::new("idle", "unused", &[]), test_options());
        let err = session.call_tool("add", serde_json::Map::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected { .. }));
        let err = session.list_tools().await.unwrap_err();
        assert!(matches!(err, RpcError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let (session, _peer) = ready_session(test_options()).await;
        let (channel, _other) = pipe();
        let err = session.attach(channel).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_tool_error_payload_surfaces_verbatim() {
        let (session, mut peer) = ready_session(test_options()).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 1, "b": 2}))).await }
        });
        let request = peer.expect(MessageKind::CallRequest).await;
        peer.reply(
            MessageKind::CallResponse,
            request.id.unwrap(),
            json!({"error": {"category": "overflow", "message": "sum overflows i64"}}),
        )
        .await;

        match call.await.unwrap().unwrap_err() {
            RpcError::ToolExecution {
                tool,
                category,
                message,
            } => {
                assert_eq!(tool, "add");
                assert_eq!(category, "overflow");
                assert_eq!(message, "sum overflows i64");
            }
            other => panic!("expected ToolExecution, got {other:?}"),
        }
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_usable() {
        let options = SessionOptions {
            call_timeout: Duration::from_millis(50),
            ..test_options()
        };
        let (session, mut peer) = ready_session(options).await;

        let err = session
            .call_tool("add", args(json!({"a": 1, "b": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert_eq!(session.pending_count().await, 0);
        assert!(session.is_ready());

        // The late request is still in the pipe; answer the next one.
        peer.expect(MessageKind::CallRequest).await;
        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 2, "b": 2}))).await }
        });
        let request = peer.expect(MessageKind::CallRequest).await;
        peer.result(request.id.unwrap(), json!(4)).await;
        assert_eq!(call.await.unwrap().unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_repeated_timeouts_close_session() {
        let options = SessionOptions {
            call_timeout: Duration::from_millis(20),
            max_consecutive_timeouts: 2,
            ..test_options()
        };
        let (session, _peer) = ready_session(options).await;

        for _ in 0..2 {
            let err = session
                .call_tool("add", args(json!({"a": 1, "b": 2})))
                .await
                .unwrap_err();
            assert!(matches!(err, RpcError::Timeout { .. }));
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_exit_fails_pending_and_closes() {
        let (session, mut peer) = ready_session(test_options()).await;
        let mut states = session.subscribe();

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 1, "b": 2}))).await }
        });
        peer.expect(MessageKind::CallRequest).await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }), "got {err:?}");
        states
            .wait_for(|state| *state == SessionState::Closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_protocol_message_is_fatal() {
        let (session, mut peer) = ready_session(test_options()).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", args(json!({"a": 1, "b": 2}))).await }
        });
        peer.expect(MessageKind::CallRequest).await;
        peer.writer
            .send(&Message::one_shot(MessageKind::ListRequest, json!(null)))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }), "got {err:?}");
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (channel, mut peer) = pipe();
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(50),
            ..test_options()
        };
        let session = RpcSession::new(ServerDescriptor::new("slow", "unused", &[]), options);

        let (result, _) = tokio::join!(session.attach(channel), peer.reader.receive());
        let err = result.unwrap_err();
        assert!(matches!(err, RpcError::Handshake { .. }));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (channel, mut peer) = pipe();
        let session = RpcSession::new(ServerDescriptor::new("old", "unused", &[]), test_options());

        let peer_side = async {
            peer.expect(MessageKind::HandshakeRequest).await;
            peer.writer
                .send(&Message::one_shot(
                    MessageKind::HandshakeResponse,
                    json!({"protocolVersion": "0.1", "server": {"name": "old"}}),
                ))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(session.attach(channel), peer_side);
        assert!(matches!(result.unwrap_err(), RpcError::Handshake { .. }));
    }

    fn handshake_response() -> Message {
        Message::one_shot(
            MessageKind::HandshakeResponse,
            json!({"protocolVersion": PROTOCOL_VERSION, "server": {"name": "late"}}),
        )
    }

    /// A large argument against a peer that has stopped reading its input.
    fn oversized_args() -> serde_json::Map<String, serde_json::Value> {
        args(json!({"a": "x".repeat(10 * 1024), "b": 1}))
    }

    #[tokio::test]
    async fn test_blocked_write_times_out_and_closes() {
        let options = SessionOptions {
            call_timeout: Duration::from_millis(100),
            ..test_options()
        };
        let (session, _peer) = ready_session_over(pipe_with_capacity(256), options).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            session.call_tool("add", oversized_args()),
        )
        .await
        .expect("call hung on a full pipe");

        let err = result.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_blocked_write() {
        let options = SessionOptions {
            call_timeout: Duration::from_millis(300),
            ..test_options()
        };
        let (session, _peer) = ready_session_over(pipe_with_capacity(256), options).await;

        let call = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.call_tool("add", oversized_args()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());

        tokio::time::timeout(Duration::from_secs(1), session.disconnect())
            .await
            .expect("disconnect hung behind a blocked write")
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call never returned")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_cancels_connect() {
        let (channel, mut peer) = pipe();
        let session = Arc::new(RpcSession::new(
            ServerDescriptor::new("fake", "unused", &[]),
            test_options(),
        ));

        let connect = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.attach(channel).await }
        });
        peer.expect(MessageKind::HandshakeRequest).await;
        assert_eq!(session.state(), SessionState::Connecting);

        session.disconnect().await.unwrap();
        // The client may already have dropped its end.
        let _ = peer.writer.send(&handshake_response()).await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Closed);

        let eof = tokio::time::timeout(Duration::from_millis(500), peer.reader.receive()).await;
        assert!(matches!(eof, Ok(Ok(Received::EndOfStream))));
    }

    #[tokio::test]
    async fn test_disconnect_during_catalog_fetch_cancels_connect() {
        let (channel, mut peer) = pipe();
        let session = Arc::new(RpcSession::new(
            ServerDescriptor::new("fake", "unused", &[]),
            test_options(),
        ));

        let connect = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.attach(channel).await }
        });
        peer.expect(MessageKind::HandshakeRequest).await;
        peer.writer.send(&handshake_response()).await.unwrap();
        peer.expect(MessageKind::ListRequest).await;

        session.disconnect().await.unwrap();

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Closed);

        let eof = tokio::time::timeout(Duration::from_millis(500), peer.reader.receive()).await;
        assert!(matches!(eof, Ok(Ok(Received::EndOfStream))));
    }
}
