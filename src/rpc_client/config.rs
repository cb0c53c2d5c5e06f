//! Orchestrator configuration loading.
//!
//! Reads a JSON or YAML file listing the tool servers to spawn, resolving
//! `${VAR}` / `${VAR:-default}` references before parsing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::RpcError;
use super::session::SessionOptions;
use super::types::ServerDescriptor;

/// Env var naming an explicit config file.
pub const CONFIG_ENV: &str = "TOOLMESH_CONFIG";

/// File names searched in a directory, in order.
const CONFIG_FILE_NAMES: [&str; 3] = ["toolmesh.yaml", "toolmesh.yml", "toolmesh.json"];

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-request timeout in milliseconds.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    /// Handshake timeout in milliseconds.
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
    /// Servers to register, in order.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl OrchestratorConfig {
    /// Session options with this config's timeouts applied over the defaults.
    pub fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions::default();
        if let Some(ms) = self.call_timeout_ms {
            options.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.handshake_timeout_ms {
            options.handshake_timeout = Duration::from_millis(ms);
        }
        options
    }

    /// Reject duplicate or empty server names.
    pub fn validate(&self) -> Result<(), RpcError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(RpcError::Config {
                    reason: format!("server with command '{}' has an empty name", server.command),
                });
            }
            if !seen.insert(server.name.as_str()) {
                return Err(RpcError::Config {
                    reason: format!("duplicate server name '{}'", server.name),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLMESH_CONFIG`, then `start`, then the platform config dir
/// (`~/.config/toolmesh/` on Linux).
pub fn find_config_path(start: &Path) -> Result<PathBuf, RpcError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(RpcError::Config {
            reason: format!("{CONFIG_ENV} points to missing file {}", candidate.display()),
        });
    }

    let mut dirs_to_search = vec![start.to_path_buf()];
    if let Some(config_dir) = dirs::config_dir() {
        dirs_to_search.push(config_dir.join("toolmesh"));
    }

    for dir in dirs_to_search {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    Err(RpcError::Config {
        reason: format!("could not find {}", CONFIG_FILE_NAMES.join(" or ")),
    })
}

/// Load, interpolate, parse and validate a config file.
///
/// `.yaml` / `.yml` files are parsed as YAML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, RpcError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RpcError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let config = parse_config(&raw, is_yaml)?;

    tracing::debug!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded orchestrator config"
    );
    Ok(config)
}

/// Parse config text (after interpolation) and validate it.
pub fn parse_config(raw: &str, is_yaml: bool) -> Result<OrchestratorConfig, RpcError> {
    let interpolated = interpolate_env_vars(raw);

    let config: OrchestratorConfig = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| RpcError::Config {
            reason: format!("failed to parse config: {e}"),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| RpcError::Config {
            reason: format!("failed to parse config: {e}"),
        })?
    };

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
