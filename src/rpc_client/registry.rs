//! Tool registry — maps every discovered tool to the server that owns it.
//!
//! Provides:
//! - Atomic merge of a server's catalog, rejecting name collisions
//! - Resolution of a tool name to its owning server
//! - Removal of every tool owned by a disconnected server

use std::collections::{BTreeSet, HashMap, HashSet};

use super::errors::RpcError;
use super::types::ToolDescriptor;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Registry of tools across all connected servers.
///
/// Tool names are global: two servers may not expose the same name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `tool_name → definition` (the definition names its server).
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server's catalog.
    ///
    /// Fails without inserting anything if any incoming name is already
    /// owned by a different server or appears twice in `tools`. Tools the
    /// same server registered before are replaced.
    pub fn merge(&mut self, server_name: &str, tools: Vec<ToolDescriptor>) -> Result<(), RpcError> {
        {
            let mut incoming = HashSet::new();
            for tool in &tools {
                if let Some(existing) = self.tools.get(&tool.name) {
                    if existing.server != server_name {
                        return Err(RpcError::DuplicateTool {
                            name: tool.name.clone(),
                            server: server_name.to_string(),
                            existing_server: existing.server.clone(),
                        });
                    }
                }
                if !incoming.insert(tool.name.as_str()) {
                    return Err(RpcError::DuplicateTool {
                        name: tool.name.clone(),
                        server: server_name.to_string(),
                        existing_server: server_name.to_string(),
                    });
                }
            }
        }

        let count = tools.len();
        for mut tool in tools {
            tool.server = server_name.to_string();
            self.tools.insert(tool.name.clone(), tool);
        }

        tracing::debug!(server = server_name, count, "merged server tools");
        Ok(())
    }

    /// Resolve the server that owns `tool_name`.
    pub fn resolve(&self, tool_name: &str) -> Result<&str, RpcError> {
        self.tools
            .get(tool_name)
            .map(|def| def.server.as_str())
            .ok_or_else(|| RpcError::UnknownTool {
                name: tool_name.to_string(),
            })
    }

    /// Remove all tools belonging to a server. Returns how many were removed.
    pub fn remove(&mut self, server_name: &str) -> usize {
        let before = self.tools.len();
        self.tools.retain(|_, def| def.server != server_name);
        before - self.tools.len()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All registered tool definitions, sorted by name.
    pub fn all_tools(&self) -> Vec<&ToolDescriptor> {
        let mut tools: Vec<&ToolDescriptor> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// All registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|def| def.server == server_name)
            .count()
    }

    /// Return all unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.tools
            .values()
            .map(|def| def.server.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.tools.clear();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
