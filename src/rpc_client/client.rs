//! Orchestrator — high-level interface for multi-server tool execution.
//!
//! Owns the server descriptors, one [`RpcSession`] per connected server and
//! the [`ToolRegistry`] used to route calls by tool name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::RwLock;

use super::config::OrchestratorConfig;
use super::errors::RpcError;
use super::registry::ToolRegistry;
use super::schema;
use super::session::{RpcSession, SessionOptions, SessionState};
use super::types::{ServerDescriptor, ToolDescriptor};

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Outcome of [`Orchestrator::connect_all`].
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Servers brought to `Ready`, in registration order.
    pub connected: Vec<String>,
    /// Servers that failed, in registration order.
    pub failed: Vec<(String, RpcError)>,
}

impl ConnectReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Collapse into a `Result`, aggregating every failure.
    pub fn into_result(self) -> Result<Vec<String>, RpcError> {
        if self.failed.is_empty() {
            Ok(self.connected)
        } else {
            Err(RpcError::ConnectFailed {
                failures: self.failed,
            })
        }
    }
}

/// Outcome of [`Orchestrator::disconnect_all`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Sessions that were disconnected.
    pub closed: Vec<String>,
    /// Sessions whose shutdown reported an error.
    pub errors: Vec<(String, RpcError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

#[derive(Default)]
struct OrchestratorState {
    /// Registered servers, in registration order.
    descriptors: Vec<ServerDescriptor>,
    /// Sessions that reached `Ready`.
    sessions: HashMap<String, Arc<RpcSession>>,
    /// Tools of every `Ready` session.
    registry: ToolRegistry,
    /// Sessions between spawn and publish; a shutdown cancels these too.
    connecting: Vec<Arc<RpcSession>>,
}

impl OrchestratorState {
    fn is_registered(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name == name)
    }

    /// Detach a server's session and tools. The session is not closed.
    fn evict(&mut self, name: &str) -> Option<Arc<RpcSession>> {
        let removed = self.registry.remove(name);
        let session = self.sessions.remove(name);
        if session.is_some() || removed > 0 {
            tracing::debug!(server = name, tools = removed, "evicted server");
        }
        session
    }

    /// Forget an in-flight session. `false` if a shutdown already took it.
    fn finish_connecting(&mut self, session: &Arc<RpcSession>) -> bool {
        let before = self.connecting.len();
        self.connecting.retain(|s| !Arc::ptr_eq(s, session));
        self.connecting.len() != before
    }

    /// Detach every in-flight session for `name`.
    fn cancel_connecting(&mut self, name: &str) -> Vec<Arc<RpcSession>> {
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connecting)
            .into_iter()
            .partition(|s| s.name() == name);
        self.connecting = kept;
        cancelled
    }

    /// Everything a server currently has open: its published session and
    /// any connect still in flight.
    fn detach(&mut self, name: &str) -> Vec<Arc<RpcSession>> {
        let mut sessions = self.cancel_connecting(name);
        sessions.extend(self.evict(name));
        sessions
    }
}

/// Disconnect every session, keeping the first error.
async fn disconnect_each(sessions: Vec<Arc<RpcSession>>) -> Result<(), RpcError> {
    let results =
        futures::future::join_all(sessions.iter().map(|session| session.disconnect())).await;
    results.into_iter().collect()
}

/// Manages many tool servers and routes tool calls to them by name.
///
/// All operations take `&self`, so an orchestrator can be shared behind an
/// `Arc` and called from several tasks at once.
pub struct Orchestrator {
    options: SessionOptions,
    inner: Arc<RwLock<OrchestratorState>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl Orchestrator {
    /// Create an orchestrator with no servers.
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            inner: Arc::new(RwLock::new(OrchestratorState::default())),
        }
    }

    /// Create an orchestrator with every configured server registered.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let state = OrchestratorState {
            descriptors: config.servers.clone(),
            ..OrchestratorState::default()
        };
        Ok(Self {
            options: config.session_options(),
            inner: Arc::new(RwLock::new(state)),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Register a server. No process is started.
    pub async fn add_server(&self, descriptor: ServerDescriptor) -> Result<(), RpcError> {
        let mut state = self.inner.write().await;
        if state.is_registered(&descriptor.name) {
            return Err(RpcError::DuplicateServer {
                name: descriptor.name,
            });
        }
        tracing::debug!(server = %descriptor.name, command = %descriptor.command, "server registered");
        state.descriptors.push(descriptor);
        Ok(())
    }

    /// Disconnect a server if needed and forget it.
    pub async fn remove_server(&self, name: &str) -> Result<(), RpcError> {
        let sessions = {
            let mut state = self.inner.write().await;
            let Some(index) = state.descriptors.iter().position(|d| d.name == name) else {
                return Err(RpcError::UnknownServer {
                    name: name.to_string(),
                });
            };
            state.descriptors.remove(index);
            state.detach(name)
        };

        disconnect_each(sessions).await
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect one registered server and merge its catalog.
    ///
    /// A server that is already `Ready` is left alone.
    pub async fn connect_server(&self, name: &str) -> Result<(), RpcError> {
        let session = {
            let mut state = self.inner.write().await;
            let descriptor = state
                .descriptors
                .iter()
                .find(|d| d.name == name)
                .cloned()
                .ok_or_else(|| RpcError::UnknownServer {
                    name: name.to_string(),
                })?;
            if state.sessions.get(name).is_some_and(|s| s.is_ready()) {
                return Ok(());
            }
            let session = Arc::new(RpcSession::new(descriptor, self.options.clone()));
            state.connecting.push(Arc::clone(&session));
            session
        };

        let connected = session.connect().await;
        match connected {
            Ok(tools) => self.install(session, tools).await,
            Err(e) => {
                self.inner.write().await.finish_connecting(&session);
                Err(e)
            }
        }
    }

    /// Connect every registered server that is not already `Ready`.
    ///
    /// Servers connect concurrently; catalogs are merged in registration
    /// order once all of them have finished. One failure never aborts the
    /// others.
    pub async fn connect_all(&self) -> ConnectReport {
        let sessions: Vec<Arc<RpcSession>> = {
            let mut state = self.inner.write().await;
            let sessions: Vec<Arc<RpcSession>> = state
                .descriptors
                .iter()
                .filter(|d| !state.sessions.get(&d.name).is_some_and(|s| s.is_ready()))
                .map(|d| Arc::new(RpcSession::new(d.clone(), self.options.clone())))
                .collect();
            state.connecting.extend(sessions.iter().cloned());
            sessions
        };

        tracing::info!(servers = sessions.len(), "connecting servers");

        let tasks = sessions.iter().map(|session| {
            let session = Arc::clone(session);
            tokio::spawn(async move { session.connect().await })
        });
        let outcomes = futures::future::join_all(tasks).await;

        let mut report = ConnectReport::default();
        for (session, outcome) in sessions.into_iter().zip(outcomes) {
            let name = session.name().to_string();
            let result = match outcome {
                Ok(Ok(tools)) => self.install(session, tools).await,
                Ok(Err(e)) => {
                    self.inner.write().await.finish_connecting(&session);
                    Err(e)
                }
                Err(join_err) => {
                    self.inner.write().await.finish_connecting(&session);
                    let e = RpcError::Spawn {
                        server: name.clone(),
                        reason: format!("connect task failed: {join_err}"),
                    };
                    let _ = session.disconnect().await;
                    Err(e)
                }
            };
            match result {
                Ok(()) => report.connected.push(name),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server failed to connect");
                    report.failed.push((name, e));
                }
            }
        }

        let tools = self.tool_count().await;
        tracing::info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            tools,
            "connect complete"
        );
        report
    }

    /// Publish a freshly connected session and its tools.
    ///
    /// On any rejection the new session is disconnected. A session that a
    /// shutdown cancelled while it was connecting is never published.
    async fn install(
        &self,
        session: Arc<RpcSession>,
        tools: Vec<ToolDescriptor>,
    ) -> Result<(), RpcError> {
        let name = session.name().to_string();

        let outcome = {
            let mut state = self.inner.write().await;
            if !state.finish_connecting(&session) {
                Err(RpcError::Cancelled {
                    server: name.clone(),
                })
            } else if !state.is_registered(&name) {
                Err(RpcError::UnknownServer { name: name.clone() })
            } else if state.sessions.get(&name).is_some_and(|s| s.is_ready()) {
                // Lost a race with another connect of the same server.
                Ok(None)
            } else if !session.is_ready() {
                Err(RpcError::NotConnected {
                    server: name.clone(),
                })
            } else {
                let stale = state.evict(&name);
                match state.registry.merge(&name, tools) {
                    Ok(()) => {
                        state.sessions.insert(name.clone(), Arc::clone(&session));
                        Ok(Some(stale))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(Some(stale)) => {
                if let Some(stale) = stale {
                    let _ = stale.disconnect().await;
                }
                self.watch(&session);
                Ok(())
            }
            Ok(None) => {
                let _ = session.disconnect().await;
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = session.disconnect().await {
                    tracing::warn!(server = %name, error = %close_err, "error while closing rejected session");
                }
                Err(e)
            }
        }
    }

    /// Evict a session and its tools as soon as it leaves `Ready` on its own.
    fn watch(&self, session: &Arc<RpcSession>) {
        let mut states = session.subscribe();
        let session = Arc::downgrade(session);
        let inner: Weak<RwLock<OrchestratorState>> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            if states
                .wait_for(|state| *state != SessionState::Ready)
                .await
                .is_err()
            {
                return;
            }
            let (Some(session), Some(inner)) = (session.upgrade(), inner.upgrade()) else {
                return;
            };

            let evicted = {
                let mut state = inner.write().await;
                let current = state
                    .sessions
                    .get(session.name())
                    .is_some_and(|s| Arc::ptr_eq(s, &session));
                current.then(|| state.evict(session.name()))
            };

            if evicted.is_some() {
                tracing::warn!(
                    server = %session.name(),
                    state = %session.state(),
                    "session lost; tools evicted"
                );
            }
            if let Err(e) = session.disconnect().await {
                tracing::warn!(server = %session.name(), error = %e, "failed to reap lost session");
            }
        });
    }

    /// Disconnect one server and evict its tools. Idempotent.
    pub async fn disconnect_server(&self, name: &str) -> Result<(), RpcError> {
        let sessions = {
            let mut state = self.inner.write().await;
            if !state.is_registered(name) {
                return Err(RpcError::UnknownServer {
                    name: name.to_string(),
                });
            }
            state.detach(name)
        };

        disconnect_each(sessions).await
    }

    /// Disconnect every session, collecting failures instead of stopping.
    ///
    /// Sessions and tools are unpublished before any channel is closed, and
    /// connects still in flight are cancelled. Calling this again is a no-op.
    pub async fn disconnect_all(&self) -> ShutdownReport {
        let mut sessions: Vec<Arc<RpcSession>> = {
            let mut state = self.inner.write().await;
            state.registry.clear();
            let mut sessions: Vec<_> = state.sessions.drain().map(|(_, s)| s).collect();
            sessions.append(&mut state.connecting);
            sessions
        };
        sessions.sort_by(|a, b| a.name().cmp(b.name()));

        let results =
            futures::future::join_all(sessions.iter().map(|session| session.disconnect())).await;

        let mut report = ShutdownReport::default();
        for (session, result) in sessions.iter().zip(results) {
            let name = session.name().to_string();
            if let Err(e) = result {
                tracing::warn!(server = %name, error = %e, "error during shutdown");
                report.errors.push((name.clone(), e));
            }
            report.closed.push(name);
        }

        if !report.closed.is_empty() {
            tracing::info!(
                closed = report.closed.len(),
                errors = report.errors.len(),
                "all servers disconnected"
            );
        }
        report
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke a tool by name on whichever server owns it.
    ///
    /// Steps:
    /// 1. Resolve the owning server (no I/O for unknown tools)
    /// 2. Check the server is `Ready`
    /// 3. Validate arguments against the tool's input schema
    /// 4. Send the call and return the peer's result unchanged
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let (session, input_schema) = {
            let state = self.inner.read().await;
            let server = state.registry.resolve(tool)?;
            let session = state
                .sessions
                .get(server)
                .filter(|s| s.is_ready())
                .cloned()
                .ok_or_else(|| RpcError::NotConnected {
                    server: server.to_string(),
                })?;
            let input_schema = state
                .registry
                .get(tool)
                .map(|t| t.input_schema.clone())
                .unwrap_or_default();
            (session, input_schema)
        };

        let arguments = if arguments.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            arguments
        };
        schema::validate_arguments(tool, &input_schema, &arguments)?;
        let serde_json::Value::Object(arguments) = arguments else {
            return Err(RpcError::SchemaValidation {
                tool: tool.to_string(),
                reason: "arguments must be a JSON object".into(),
            });
        };

        let start = Instant::now();
        let result = session.call_tool(tool, arguments).await;
        tracing::debug!(
            server = %session.name(),
            tool,
            ok = result.is_ok(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "tool call finished"
        );
        result
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Every registered tool, sorted by name.
    pub async fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        let state = self.inner.read().await;
        state.registry.all_tools().into_iter().cloned().collect()
    }

    /// State of a registered server; `None` if the name is unknown.
    pub async fn server_state(&self, name: &str) -> Option<SessionState> {
        let state = self.inner.read().await;
        if !state.is_registered(name) {
            return None;
        }
        Some(
            state
                .sessions
                .get(name)
                .map(|s| s.state())
                .unwrap_or(SessionState::Disconnected),
        )
    }

    /// Names of `Ready` servers, sorted.
    pub async fn connected_servers(&self) -> Vec<String> {
        let state = self.inner.read().await;
        let mut names: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.is_ready())
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Names of every registered server, in registration order.
    pub async fn configured_servers(&self) -> Vec<String> {
        let state = self.inner.read().await;
        state.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    /// Number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.inner.read().await.registry.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
