//! A single supervised tool-server connection.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Value, json};

use tether_rpc::dispatch::{NotificationHandler, RpcClient};
use tether_rpc::transport::{ChildSpec, ChildTransport, Transport};
use tether_types::{HostError, RpcError, ToolContent, ToolResult};

/// Protocol revision sent in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Attempts for tool discovery, with linear backoff between them.
const DISCOVERY_ATTEMPTS: u32 = 3;
const DISCOVERY_BACKOFF: Duration = Duration::from_secs(1);
/// Pages followed per catalog fetch. A server still handing out cursors
/// past this is broken and must not hang startup.
const MAX_CATALOG_PAGES: usize = 64;

/// Lifecycle of a server connection. Transitions are one-way except
/// `Ready → Error`, which a supervised restart may undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not started.
    Uninitialized,
    /// Transport being opened.
    Connecting,
    /// Handshake done, catalog not yet fetched.
    Initialized,
    /// Serving tool calls.
    Ready,
    /// Transport or handshake failure.
    Error,
    /// Shut down; terminal.
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Initialized => "initialized",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Configuration for one tool server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    /// Unique server name; the wire-name prefix.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Per-server environment additions.
    pub env: HashMap<String, String>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
    /// Restart the server when its transport dies. Off by default.
    pub auto_restart: bool,
}

impl ServerSpec {
    /// A spec with just a name and command.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            auto_restart: false,
        }
    }

    fn child_spec(&self) -> ChildSpec {
        ChildSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// One tool from a server's catalog, with its native name.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTool {
    /// Native tool name as the server advertises it.
    pub name: String,
    /// Description for the model.
    pub description: String,
    /// JSON Schema for the input, passed through verbatim.
    pub input_schema: Value,
}

/// A supervised connection to one tool server.
///
/// Owns the child process (through its transport), the request
/// dispatcher, and the cached tool catalog.
pub struct ServerConnection {
    spec: ServerSpec,
    state: RwLock<ServerState>,
    client: RwLock<Option<Arc<RpcClient>>>,
    tools: RwLock<Vec<ServerTool>>,
}

impl ServerConnection {
    /// Create an unstarted connection.
    #[must_use]
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            state: RwLock::new(ServerState::Uninitialized),
            client: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// The configured server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Whether this server restarts after a transport failure.
    #[must_use]
    pub fn auto_restart(&self) -> bool {
        self.spec.auto_restart
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: ServerState) {
        *self.state.write().expect("state lock poisoned") = state;
        tracing::debug!(server = %self.spec.name, %state, "server state");
    }

    /// Snapshot of the cached catalog.
    #[must_use]
    pub fn tools(&self) -> Vec<ServerTool> {
        self.tools.read().expect("tools lock poisoned").clone()
    }

    fn client(&self) -> Result<Arc<RpcClient>, HostError> {
        self.client
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or_else(|| HostError::NotReady {
                server: self.spec.name.clone(),
                state: self.state().to_string(),
            })
    }

    /// Spawn the child, perform the initialize handshake, and fetch the
    /// tool catalog.
    ///
    /// # Errors
    ///
    /// [`HostError::Spawn`] when the process cannot start,
    /// [`HostError::Initialization`] when the handshake fails,
    /// [`HostError::Discovery`] when the catalog cannot be fetched.
    /// The connection is left in `Error` state on any failure.
    pub async fn start(&self) -> Result<(), HostError> {
        self.set_state(ServerState::Connecting);

        let transport = ChildTransport::spawn(&self.spec.child_spec()).map_err(|source| {
            self.set_state(ServerState::Error);
            HostError::Spawn { server: self.spec.name.clone(), source }
        })?;
        self.start_with_transport(Arc::new(transport)).await
    }

    /// Run the handshake and discovery over an already-open transport.
    ///
    /// [`start`](Self::start) uses this after spawning the child; tests
    /// and non-process transports call it directly.
    ///
    /// # Errors
    ///
    /// Same failures as [`start`](Self::start), minus spawn.
    pub async fn start_with_transport(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), HostError> {
        self.set_state(ServerState::Connecting);

        let server = self.spec.name.clone();
        let on_notification: NotificationHandler = Arc::new(move |method, params| {
            tracing::debug!(server = %server, method, ?params, "server notification");
        });
        let client = Arc::new(RpcClient::new(transport, Some(on_notification)));

        if let Err(err) = self.initialize(&client).await {
            client.close().await;
            self.set_state(ServerState::Error);
            return Err(err);
        }
        *self.client.write().expect("client lock poisoned") = Some(Arc::clone(&client));
        self.set_state(ServerState::Initialized);

        match self.discover_tools(&client).await {
            Ok(tools) => {
                tracing::info!(server = %self.spec.name, count = tools.len(), "tool catalog cached");
                *self.tools.write().expect("tools lock poisoned") = tools;
                self.set_state(ServerState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_state(ServerState::Error);
                Err(err)
            }
        }
    }

    /// Restart after an `Error`: tear down the old client and run
    /// [`start`](Self::start) again. The catalog is re-fetched.
    ///
    /// # Errors
    ///
    /// Same failures as [`start`](Self::start).
    pub async fn restart(&self) -> Result<(), HostError> {
        let old = self.client.write().expect("client lock poisoned").take();
        if let Some(old) = old {
            old.close().await;
        }
        self.tools.write().expect("tools lock poisoned").clear();
        self.start().await
    }

    async fn initialize(&self, client: &RpcClient) -> Result<(), HostError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "tether",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let reply = client.call("initialize", Some(params)).await.map_err(|e| {
            HostError::Initialization { server: self.spec.name.clone(), reason: e.to_string() }
        })?;

        let version = reply.get("protocolVersion").and_then(Value::as_str);
        if version.is_none() {
            return Err(HostError::Initialization {
                server: self.spec.name.clone(),
                reason: "initialize reply missing protocolVersion".into(),
            });
        }
        if let Some(info) = reply.get("serverInfo") {
            tracing::debug!(server = %self.spec.name, ?info, "initialize handshake complete");
        }

        client.notify("notifications/initialized", None).await.map_err(|e| {
            HostError::Initialization { server: self.spec.name.clone(), reason: e.to_string() }
        })
    }

    async fn discover_tools(&self, client: &RpcClient) -> Result<Vec<ServerTool>, HostError> {
        let mut last_error = String::new();
        for attempt in 1..=DISCOVERY_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(DISCOVERY_BACKOFF * (attempt - 1)).await;
            }
            match self.fetch_catalog(client).await {
                Ok(tools) => return Ok(tools),
                // RPC-level failures may be transient; an unparseable
                // catalog is fatal immediately.
                Err(HostError::Rpc(err)) => {
                    tracing::warn!(server = %self.spec.name, attempt, error = %err, "tools/list failed");
                    last_error = err.to_string();
                }
                Err(err) => return Err(err),
            }
        }
        Err(HostError::Discovery { server: self.spec.name.clone(), reason: last_error })
    }

    /// One full catalog fetch, following `nextCursor` pagination.
    ///
    /// Bounded: a repeated cursor or more than [`MAX_CATALOG_PAGES`]
    /// pages fails discovery instead of looping against a broken
    /// server. These failures are fatal, not retried.
    async fn fetch_catalog(&self, client: &RpcClient) -> Result<Vec<ServerTool>, HostError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();
        for _page in 0..MAX_CATALOG_PAGES {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let reply = client.call("tools/list", params).await.map_err(HostError::Rpc)?;
            tools.extend(self.parse_catalog(&reply)?);
            match reply.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => {
                    if !seen_cursors.insert(next.to_string()) {
                        return Err(HostError::Discovery {
                            server: self.spec.name.clone(),
                            reason: format!("tools/list repeated cursor {next}"),
                        });
                    }
                    cursor = Some(next.to_string());
                }
                _ => return Ok(tools),
            }
        }
        Err(HostError::Discovery {
            server: self.spec.name.clone(),
            reason: format!("tools/list exceeded {MAX_CATALOG_PAGES} pages"),
        })
    }

    /// Lenient catalog parsing: a malformed tool entry is skipped with a
    /// warning; a catalog that is not a list at all is fatal.
    fn parse_catalog(&self, reply: &Value) -> Result<Vec<ServerTool>, HostError> {
        let entries = reply.get("tools").and_then(Value::as_array).ok_or_else(|| {
            HostError::Discovery {
                server: self.spec.name.clone(),
                reason: "tools/list reply has no tools array".into(),
            }
        })?;

        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(name) = entry.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())
            else {
                tracing::warn!(server = %self.spec.name, ?entry, "skipping tool without a name");
                continue;
            };
            let schema = match entry.get("inputSchema") {
                None => json!({"type": "object"}),
                Some(schema) if schema.is_object() => schema.clone(),
                Some(other) => {
                    tracing::warn!(
                        server = %self.spec.name,
                        tool = name,
                        schema = %other,
                        "skipping tool with non-object inputSchema"
                    );
                    continue;
                }
            };
            tools.push(ServerTool {
                name: name.to_string(),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: schema,
            });
        }
        Ok(tools)
    }

    /// Invoke a tool by its *native* name.
    ///
    /// Recognizes failures at the JSON-RPC envelope level and the legacy
    /// nested `isError: true`; in both cases the human-facing text is
    /// pulled from the content blocks when no explicit message exists.
    ///
    /// # Errors
    ///
    /// [`HostError::NotReady`] unless the server is `Ready`;
    /// [`HostError::ToolCall`] for envelope-level failures;
    /// [`HostError::Rpc`] for timeouts and transport death (the
    /// connection moves to `Error` on transport death).
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<ToolResult, HostError> {
        if self.state() != ServerState::Ready {
            return Err(HostError::NotReady {
                server: self.spec.name.clone(),
                state: self.state().to_string(),
            });
        }
        let client = self.client()?;
        let params = json!({ "name": tool, "arguments": arguments });
        let reply = match client.call_with_deadline("tools/call", Some(params), deadline).await {
            Ok(reply) => reply,
            Err(RpcError::TransportClosed) => {
                self.set_state(ServerState::Error);
                return Err(RpcError::TransportClosed.into());
            }
            Err(RpcError::Remote { code, message, data }) => {
                return Err(HostError::ToolCall {
                    tool: tool.to_string(),
                    reason: match data {
                        Some(data) => format!("{message} ({code}): {data}"),
                        None => format!("{message} ({code})"),
                    },
                });
            }
            Err(err) => return Err(err.into()),
        };
        Ok(parse_tool_result(&reply))
    }

    /// Liveness probe: a `ping` round trip within `deadline`.
    ///
    /// # Errors
    ///
    /// [`HostError::NotReady`] unless the server is `Ready`; the RPC
    /// failure otherwise. A transport death moves the server to `Error`.
    pub async fn ping(&self, deadline: Duration) -> Result<(), HostError> {
        if self.state() != ServerState::Ready {
            return Err(HostError::NotReady {
                server: self.spec.name.clone(),
                state: self.state().to_string(),
            });
        }
        let client = self.client()?;
        match client.call_with_deadline("ping", None, deadline).await {
            Ok(_) => Ok(()),
            Err(RpcError::TransportClosed) => {
                self.set_state(ServerState::Error);
                Err(RpcError::TransportClosed.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Graceful shutdown: best-effort notification, close the transport,
    /// bounded wait, kill on timeout (inside the transport).
    pub async fn stop(&self) {
        let client = self.client.write().expect("client lock poisoned").take();
        if let Some(client) = client {
            let _ = client.notify("notifications/shutdown", None).await;
            client.close().await;
        }
        self.set_state(ServerState::Stopped);
    }
}

/// Interpret a `tools/call` result value.
fn parse_tool_result(reply: &Value) -> ToolResult {
    let content: Vec<ToolContent> = reply
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| serde_json::from_value(b.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let is_error = reply.get("isError").and_then(Value::as_bool).unwrap_or(false);
    if !is_error {
        return ToolResult { content, is_error: false, error: None };
    }

    let explicit = reply
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let error = explicit.or_else(|| {
        let text = content.iter().filter_map(|c| c.text.as_deref()).collect::<Vec<_>>().join("\n");
        (!text.is_empty()).then_some(text)
    });
    ToolResult { content, is_error: true, error }
}
