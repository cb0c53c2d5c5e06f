//! RPC client — line-delimited JSON over stdio for tool server orchestration.
//!
//! This module handles:
//! - Spawning tool server child processes and framing their stdio
//! - Handshake, catalog fetch and id-correlated calls per session
//! - Tool discovery and aggregation across all servers
//! - Tool call routing and argument validation
//! - Coordinated, idempotent shutdown

pub mod client;
pub mod config;
pub mod errors;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ConnectReport, Orchestrator, ShutdownReport};
pub use config::{find_config_path, load_config, OrchestratorConfig};
pub use errors::RpcError;
pub use registry::ToolRegistry;
pub use session::{RpcSession, SessionOptions, SessionState};
pub use transport::Channel;
pub use types::{ServerDescriptor, ToolDescriptor, PROTOCOL_VERSION};
