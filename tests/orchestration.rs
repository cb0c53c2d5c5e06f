//! End-to-end tests against the real `math-server` and `string-server`
//! binaries.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use toolmesh::rpc_client::{
    Orchestrator, RpcError, ServerDescriptor, SessionOptions, SessionState,
};

fn options() -> SessionOptions {
    SessionOptions {
        handshake_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(2),
        ..SessionOptions::default()
    }
}

fn math(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, env!("CARGO_BIN_EXE_math-server"), &[])
}

fn strings(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, env!("CARGO_BIN_EXE_string-server"), &[])
}

async fn demo_orchestrator() -> Orchestrator {
    let orch = Orchestrator::new(options());
    orch.add_server(math("math")).await.unwrap();
    orch.add_server(strings("strings")).await.unwrap();
    let connected = orch.connect_all().await.into_result().unwrap();
    assert_eq!(connected, vec!["math", "strings"]);
    orch
}

#[tokio::test]
async fn test_demo_workflow() {
    let orch = demo_orchestrator().await;

    let names: Vec<String> = orch.list_all_tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["add", "concat", "multiply", "uppercase"]);

    assert_eq!(orch.call_tool("add", json!({"a": 5, "b": 3})).await.unwrap(), json!(8));
    assert_eq!(
        orch.call_tool("multiply", json!({"a": 7, "b": 6})).await.unwrap(),
        json!(42)
    );
    assert_eq!(
        orch.call_tool("uppercase", json!({"text": "hello"})).await.unwrap(),
        json!("HELLO")
    );
    assert_eq!(
        orch.call_tool("concat", json!({"a": "Hello", "b": "MCP", "separator": ", "}))
            .await
            .unwrap(),
        json!("Hello, MCP")
    );
    assert_eq!(
        orch.call_tool("concat", json!({"a": "Hello", "b": "MCP"}))
            .await
            .unwrap(),
        json!("Hello MCP")
    );

    let report = orch.disconnect_all().await;
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[tokio::test]
async fn test_unknown_tool_is_rejected() {
    let orch = demo_orchestrator().await;
    let err = orch.call_tool("subtract", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::UnknownTool { ref name } if name == "subtract"));
    // Sessions are unaffected
    assert_eq!(orch.connected_servers().await, vec!["math", "strings"]);
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_one_server_fails_to_spawn() {
    let orch = Orchestrator::new(options());
    orch.add_server(ServerDescriptor::new("broken", "/nonexistent/toolmesh-server", &[]))
        .await
        .unwrap();
    orch.add_server(math("math")).await.unwrap();

    let report = orch.connect_all().await;
    assert_eq!(report.connected, vec!["math"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert!(matches!(report.failed[0].1, RpcError::Spawn { .. }));

    assert_eq!(orch.server_state("math").await, Some(SessionState::Ready));
    assert_eq!(orch.call_tool("add", json!({"a": 1, "b": 2})).await.unwrap(), json!(3));
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_duplicate_tool_across_servers() {
    let orch = Orchestrator::new(options());
    orch.add_server(math("math")).await.unwrap();
    orch.add_server(math("math-copy")).await.unwrap();

    let report = orch.connect_all().await;
    assert_eq!(report.connected, vec!["math"]);
    match &report.failed[..] {
        [(server, RpcError::DuplicateTool { existing_server, .. })] => {
            assert_eq!(server, "math-copy");
            assert_eq!(existing_server, "math");
        }
        other => panic!("expected one DuplicateTool failure, got {other:?}"),
    }

    // The first registration still resolves and works
    assert_eq!(orch.call_tool("add", json!({"a": 2, "b": 2})).await.unwrap(), json!(4));
    assert_eq!(orch.tool_count().await, 2);
    assert_eq!(
        orch.server_state("math-copy").await,
        Some(SessionState::Disconnected)
    );
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_connect_then_disconnect_all_leaves_nothing() {
    let orch = demo_orchestrator().await;
    assert_eq!(orch.tool_count().await, 4);

    let report = orch.disconnect_all().await;
    assert_eq!(report.closed, vec!["math", "strings"]);
    assert_eq!(orch.tool_count().await, 0);
    assert!(orch.connected_servers().await.is_empty());
    assert!(orch.list_all_tools().await.is_empty());

    // Second shutdown is a no-op
    let again = orch.disconnect_all().await;
    assert!(again.closed.is_empty() && again.is_clean());
    assert!(matches!(
        orch.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap_err(),
        RpcError::UnknownTool { .. }
    ));
}

#[tokio::test]
async fn test_schema_violation_rejected_locally() {
    let orch = demo_orchestrator().await;

    let err = orch.call_tool("add", json!({"a": 5})).await.unwrap_err();
    assert!(matches!(err, RpcError::SchemaValidation { .. }), "got {err:?}");

    let err = orch
        .call_tool("uppercase", json!({"text": 42}))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::SchemaValidation { .. }));

    let err = orch.call_tool("add", json!([1, 2])).await.unwrap_err();
    assert!(matches!(err, RpcError::SchemaValidation { .. }));

    assert_eq!(orch.connected_servers().await.len(), 2);
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_tool_failure_surfaces_unchanged() {
    let orch = demo_orchestrator().await;
    let err = orch
        .call_tool("multiply", json!({"a": i64::MAX, "b": 2}))
        .await
        .unwrap_err();
    match err {
        RpcError::ToolExecution { tool, category, .. } => {
            assert_eq!(tool, "multiply");
            assert_eq!(category, "overflow");
        }
        other => panic!("expected ToolExecution, got {other:?}"),
    }
    // A tool failure does not hurt the session
    assert_eq!(orch.server_state("math").await, Some(SessionState::Ready));
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_rapid_and_alternating_calls() {
    let orch = demo_orchestrator().await;

    for i in 0..25i64 {
        let sum = orch.call_tool("add", json!({"a": i, "b": i})).await.unwrap();
        assert_eq!(sum, json!(i * 2));

        let text = format!("item{i}");
        let upper = orch
            .call_tool("uppercase", json!({"text": text}))
            .await
            .unwrap();
        assert_eq!(upper, json!(text.to_uppercase()));
    }
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_concurrent_calls_through_shared_orchestrator() {
    let orch = Arc::new(demo_orchestrator().await);

    let mut tasks = Vec::new();
    for i in 0..20i64 {
        let orch = Arc::clone(&orch);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                orch.call_tool("multiply", json!({"a": i, "b": 3})).await
            } else {
                orch.call_tool("concat", json!({"a": "n", "b": i.to_string(), "separator": "="}))
                    .await
            }
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let i = i as i64;
        let value = task.await.unwrap().unwrap();
        if i % 2 == 0 {
            assert_eq!(value, json!(i * 3));
        } else {
            assert_eq!(value, json!(format!("n={i}")));
        }
    }
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_disconnect_server_evicts_and_reconnects() {
    let orch = demo_orchestrator().await;

    orch.disconnect_server("math").await.unwrap();
    assert!(matches!(
        orch.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap_err(),
        RpcError::UnknownTool { .. }
    ));
    assert_eq!(orch.connected_servers().await, vec!["strings"]);
    orch.disconnect_server("math").await.unwrap();

    orch.connect_server("math").await.unwrap();
    assert_eq!(orch.call_tool("add", json!({"a": 1, "b": 1})).await.unwrap(), json!(2));

    // Connecting a Ready server again is a no-op
    orch.connect_server("math").await.unwrap();
    assert_eq!(orch.tool_count().await, 4);
    orch.disconnect_all().await;
}

#[tokio::test]
async fn test_remove_server_while_connected() {
    let orch = demo_orchestrator().await;
    orch.remove_server("strings").await.unwrap();
    assert_eq!(orch.configured_servers().await, vec!["math"]);
    assert_eq!(orch.tool_count().await, 2);
    assert!(orch.call_tool("uppercase", json!({"text": "x"})).await.is_err());
    orch.disconnect_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_peer_that_is_not_a_tool_server() {
    // `cat` echoes the handshake request back instead of answering it
    let orch = Orchestrator::new(options());
    orch.add_server(ServerDescriptor::new("echo", "cat", &[]))
        .await
        .unwrap();

    let err = orch.connect_server("echo").await.unwrap_err();
    assert!(matches!(err, RpcError::Handshake { .. }), "got {err:?}");
    assert_eq!(orch.server_state("echo").await, Some(SessionState::Disconnected));
}

#[cfg(unix)]
#[tokio::test]
async fn test_peer_exit_evicts_tools() {
    // Answers the handshake and catalog fetch, then exits.
    let script = concat!(
        "read line; ",
        r#"printf '%s\n' '{"kind":"handshake-response","payload":{"protocolVersion":"1.0","server":{"name":"sh"}}}'; "#,
        "read line; ",
        r#"printf '%s\n' '{"kind":"list-response","id":1,"payload":[{"name":"ephemeral","inputSchema":{}}]}'; "#,
        "sleep 0.3",
    );
    let orch = Orchestrator::new(options());
    orch.add_server(ServerDescriptor::new("short-lived", "sh", &["-c", script]))
        .await
        .unwrap();

    orch.connect_server("short-lived").await.unwrap();
    assert_eq!(orch.tool_count().await, 1);

    let evicted = tokio::time::timeout(Duration::from_secs(5), async {
        while orch.tool_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(evicted.is_ok(), "tools were not evicted after the peer exited");
    assert!(orch.connected_servers().await.is_empty());
    assert!(matches!(
        orch.call_tool("ephemeral", json!({})).await.unwrap_err(),
        RpcError::UnknownTool { .. }
    ));
}
