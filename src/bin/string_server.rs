//! `string-server` — serves `uppercase` and `concat` on stdio.

use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolmesh::init_tracing(None).context("failed to initialize logging")?;

    toolmesh::tool_server::builtin::string_server()
        .serve_stdio()
        .await
        .context("string-server stopped with an error")
}
