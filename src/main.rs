//! `toolmesh` — multi-server orchestration demo.
//!
//! Usage: `toolmesh [--log-file] [CONFIG]`
//!
//! Without a config argument the standard lookup is used; if that finds
//! nothing, the `math-server` and `string-server` binaries next to this
//! executable are started.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::json;

use toolmesh::rpc_client::{config, Orchestrator, OrchestratorConfig, ServerDescriptor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut log_to_file = false;
    let mut config_path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--log-file" => log_to_file = true,
            "-h" | "--help" => {
                println!("usage: toolmesh [--log-file] [CONFIG]");
                return Ok(());
            }
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'"),
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    let log_file = log_to_file.then(|| toolmesh::data_dir().join("logs").join("toolmesh.log"));
    toolmesh::init_tracing(log_file.as_deref()).context("failed to initialize logging")?;

    let config = resolve_config(config_path.as_deref())?;
    let orchestrator = Orchestrator::from_config(&config).context("invalid configuration")?;

    let outcome = run_demo(&orchestrator).await;

    let report = orchestrator.disconnect_all().await;
    println!("\n[5] Disconnected from {} server(s)", report.closed.len());
    for (server, err) in &report.errors {
        eprintln!("    shutdown error on '{server}': {err}");
    }

    outcome
}

async fn run_demo(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    println!("{}", "=".repeat(60));
    println!("Multi-Server Orchestration Demo");
    println!("{}", "=".repeat(60));

    println!("\n[1] Connecting to servers...");
    orchestrator
        .connect_all()
        .await
        .into_result()
        .context("not every server connected")?;
    println!("    Connected: {}", orchestrator.connected_servers().await.join(", "));

    println!("\n[2] Discovering available tools...");
    for tool in orchestrator.list_all_tools().await {
        println!("    - {} (from {})", tool.name, tool.server);
        println!("      {}", tool.description);
    }

    println!("\n[3] Executing demo workflow...");
    let sum = orchestrator
        .call_tool("add", json!({"a": 5, "b": 3}))
        .await
        .context("add failed")?;
    println!("    add(5, 3) = {sum}");

    let product = orchestrator
        .call_tool("multiply", json!({"a": 7, "b": 6}))
        .await
        .context("multiply failed")?;
    println!("    multiply(7, 6) = {product}");

    let upper = orchestrator
        .call_tool("uppercase", json!({"text": "hello world"}))
        .await
        .context("uppercase failed")?;
    println!("    uppercase('hello world') = {upper}");

    let joined = orchestrator
        .call_tool("concat", json!({"a": "Hello", "b": "MCP", "separator": ", "}))
        .await
        .context("concat failed")?;
    println!("    concat('Hello', 'MCP', ', ') = {joined}");

    println!("\n[4] Demo completed successfully!");
    Ok(())
}

/// Explicit path, then the standard lookup, then the bundled demo servers.
fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    if let Some(path) = explicit {
        return config::load_config(path)
            .with_context(|| format!("failed to load {}", path.display()));
    }

    let cwd = std::env::current_dir().context("failed to read working directory")?;
    match config::find_config_path(&cwd) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "using config file");
            config::load_config(&path).with_context(|| format!("failed to load {}", path.display()))
        }
        Err(e) => {
            tracing::debug!(error = %e, "no config file, using bundled demo servers");
            default_config()
        }
    }
}

fn default_config() -> anyhow::Result<OrchestratorConfig> {
    let exe = std::env::current_exe().context("failed to locate current executable")?;
    let bin_dir = exe
        .parent()
        .context("current executable has no parent directory")?;

    let sibling = |name: &str| {
        bin_dir
            .join(format!("{name}{}", std::env::consts::EXE_SUFFIX))
            .to_string_lossy()
            .into_owned()
    };

    Ok(OrchestratorConfig {
        servers: vec![
            ServerDescriptor::new("math", &sibling("math-server"), &[]),
            ServerDescriptor::new("strings", &sibling("string-server"), &[]),
        ],
        ..OrchestratorConfig::default()
    })
}
