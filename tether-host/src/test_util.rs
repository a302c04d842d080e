//! In-process tool-server helpers for tests.

use std::sync::Arc;

use serde_json::{Value, json};

use tether_rpc::codec::RpcFrame;
use tether_rpc::transport::{Transport, mock};

use crate::connection::{ServerConnection, ServerSpec};

/// Serve the peer end of a mock transport pair as a minimal tool server:
/// answers `initialize`, `tools/list` (with `tools`), and `tools/call`
/// (via `reply(name, arguments)`).
pub fn spawn_mock_server(
    transport: mock::MockTransport,
    tools: Vec<Value>,
    reply: impl Fn(&str, &Value) -> Value + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(Ok(frame)) = transport.recv().await {
            if let RpcFrame::Request { id, method, params } = frame {
                let result = match method.as_str() {
                    "initialize" => json!({
                        "protocolVersion": crate::connection::PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock", "version": "0.0.1"},
                    }),
                    "tools/list" => json!({"tools": tools}),
                    "tools/call" => {
                        let params = params.unwrap_or_default();
                        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                        reply(name, &args)
                    }
                    _ => json!(null),
                };
                let _ = transport.send(&RpcFrame::response_ok(id, result)).await;
            }
        }
    });
}

/// A `Ready` connection backed by [`spawn_mock_server`].
///
/// # Panics
///
/// Panics when the handshake fails, which is a bug in the test setup.
pub async fn ready_connection(
    name: &str,
    tools: Vec<Value>,
    reply: impl Fn(&str, &Value) -> Value + Send + 'static,
) -> Arc<ServerConnection> {
    let (ours, theirs) = mock::pair();
    spawn_mock_server(theirs, tools, reply);
    let connection = Arc::new(ServerConnection::new(ServerSpec::new(name, "unused")));
    connection
        .start_with_transport(Arc::new(ours))
        .await
        .expect("mock server handshake failed");
    connection
}

/// An `echo` tool definition whose mock reply returns `x` verbatim.
#[must_use]
pub fn echo_tool_definition() -> Value {
    json!({
        "name": "echo",
        "description": "Return x unchanged",
        "inputSchema": {
            "type": "object",
            "properties": {"x": {"type": "string"}},
            "required": ["x"],
        },
    })
}

/// Reply function for [`echo_tool_definition`].
#[must_use]
pub fn echo_reply(_name: &str, args: &Value) -> Value {
    let x = args.get("x").and_then(Value::as_str).unwrap_or_default();
    json!({"content": [{"type": "text", "text": x}]})
}
