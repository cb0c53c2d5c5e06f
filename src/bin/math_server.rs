//! `math-server` — serves `add` and `multiply` on stdio.

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the protocol.
    toolmesh::init_tracing(None).context("failed to initialize logging")?;

    toolmesh::tool_server::builtin::math_server()
        .serve_stdio()
        .await
        .context("math-server stopped with an error")
}
