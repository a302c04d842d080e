//! The multi-server host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tether_types::{HostError, RpcError, ToolDefinition, ToolResult};

use crate::connection::{ServerConnection, ServerSpec, ServerState};
use crate::wire_name;

/// Minimum deadline slice a tool call may start with. Calls with less
/// remaining time fail eagerly instead of starting.
pub const MIN_DEADLINE_SLICE: Duration = Duration::from_secs(5);

/// Default deadline handed to tool calls when the caller has none.
pub const DEFAULT_TOOL_DEADLINE: Duration = Duration::from_secs(30);

/// Owns every configured [`ServerConnection`] and routes wire-named tool
/// calls to the right server.
pub struct ServerHost {
    connections: HashMap<String, Arc<ServerConnection>>,
    min_slice: Duration,
}

impl ServerHost {
    /// Build a host from server specs. Nothing is started yet.
    #[must_use]
    pub fn new(specs: Vec<ServerSpec>) -> Self {
        let connections = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), Arc::new(ServerConnection::new(spec))))
            .collect();
        Self { connections, min_slice: MIN_DEADLINE_SLICE }
    }

    /// Override the minimum deadline slice.
    #[must_use]
    pub fn with_min_slice(mut self, min_slice: Duration) -> Self {
        self.min_slice = min_slice;
        self
    }

    /// Add an already-constructed connection (used by tests and by
    /// embedders with custom transports).
    pub fn insert(&mut self, connection: Arc<ServerConnection>) {
        self.connections.insert(connection.name().to_string(), connection);
    }

    /// Configured server names.
    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.connections.keys().map(String::as_str).collect()
    }

    /// A host restricted to the named servers, sharing the same
    /// connections. Unknown names are ignored.
    #[must_use]
    pub fn subset(&self, names: &[String]) -> ServerHost {
        let connections = self
            .connections
            .iter()
            .filter(|(name, _)| names.iter().any(|n| n == *name))
            .map(|(name, connection)| (name.clone(), Arc::clone(connection)))
            .collect();
        Self { connections, min_slice: self.min_slice }
    }

    /// Look up a connection by server name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ServerConnection>> {
        self.connections.get(name)
    }

    /// Start every server. Failures are per-server; a server that fails
    /// to start is reported and left in `Error` state while the rest
    /// come up.
    pub async fn start_all(&self) -> Vec<(String, Result<(), HostError>)> {
        let mut results = Vec::with_capacity(self.connections.len());
        for (name, connection) in &self.connections {
            let result = connection.start().await;
            if let Err(err) = &result {
                tracing::warn!(server = %name, error = %err, "server failed to start");
            }
            results.push((name.clone(), result));
        }
        results
    }

    /// Stop every server gracefully.
    pub async fn stop_all(&self) {
        for connection in self.connections.values() {
            connection.stop().await;
        }
    }

    /// Current lifecycle state of every server, sorted by name.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, ServerState)> {
        let mut all: Vec<(String, ServerState)> = self
            .connections
            .iter()
            .map(|(name, connection)| (name.clone(), connection.state()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Probe every `Ready` server with a bounded `ping`; failures move
    /// the affected server to `Error` (and restart it when its policy
    /// allows). Returns the post-probe states.
    pub async fn health_check(&self, deadline: Duration) -> Vec<(String, ServerState)> {
        for connection in self.connections.values() {
            if connection.state() != ServerState::Ready {
                continue;
            }
            if let Err(err) = connection.ping(deadline).await {
                tracing::warn!(server = %connection.name(), error = %err, "ping failed");
                if connection.auto_restart()
                    && let Err(err) = connection.restart().await
                {
                    tracing::warn!(server = %connection.name(), error = %err, "restart failed");
                }
            }
        }
        self.statuses()
    }

    /// The combined catalog of every `Ready` server, renamed to wire
    /// names. Fails closed when the configuration produces ambiguous
    /// wire names.
    ///
    /// # Errors
    ///
    /// [`HostError::WireCollision`] on ambiguity.
    pub fn tools(&self) -> Result<Vec<ToolDefinition>, HostError> {
        let mut catalog: Vec<(String, String, ToolDefinition)> = Vec::new();
        for connection in self.connections.values() {
            if connection.state() != ServerState::Ready {
                continue;
            }
            for tool in connection.tools() {
                catalog.push((
                    connection.name().to_string(),
                    tool.name.clone(),
                    ToolDefinition {
                        name: wire_name::encode(connection.name(), &tool.name),
                        description: tool.description,
                        parameters: tool.input_schema,
                    },
                ));
            }
        }
        wire_name::verify_unambiguous(
            catalog.iter().map(|(server, tool, _)| (server.as_str(), tool.as_str())),
        )?;
        let mut tools: Vec<ToolDefinition> = catalog.into_iter().map(|(_, _, def)| def).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    /// Resolve a wire name to `(connection, native_tool)`.
    ///
    /// Longest-prefix match against configured server names; when no
    /// prefix matches and exactly one server is configured, the call is
    /// routed there with the wire name taken as the native tool name.
    fn resolve(&self, wire: &str) -> Result<(Arc<ServerConnection>, String), HostError> {
        if let Some((server, tool_part)) =
            wire_name::decode(wire, self.connections.keys().map(String::as_str))
        {
            let connection = Arc::clone(&self.connections[server]);
            // The wire tool part is normalized; recover the native name
            // from the catalog.
            let native = connection
                .tools()
                .into_iter()
                .find(|t| wire_name::normalize(&t.name) == tool_part)
                .map(|t| t.name)
                .ok_or_else(|| HostError::UnknownTool(wire.to_string()))?;
            return Ok((connection, native));
        }
        if self.connections.len() == 1 {
            let connection =
                Arc::clone(self.connections.values().next().expect("one connection"));
            return Ok((connection, wire.to_string()));
        }
        Err(HostError::UnknownTool(wire.to_string()))
    }

    /// Call a wire-named tool.
    ///
    /// The deadline is the caller's *remaining* budget; below the
    /// minimum slice the call fails eagerly. A transport death marks the
    /// server `Error` and, when its policy allows, triggers a restart
    /// (the failing call still fails).
    ///
    /// # Errors
    ///
    /// Routing failures, deadline exhaustion, and per-call failures as
    /// [`HostError`].
    pub async fn call(
        &self,
        wire: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<ToolResult, HostError> {
        if deadline < self.min_slice {
            return Err(HostError::DeadlineTooTight(deadline));
        }
        let (connection, native) = self.resolve(wire)?;
        let result = connection.call_tool(&native, arguments, deadline).await;

        if let Err(HostError::Rpc(RpcError::TransportClosed)) = &result
            && connection.auto_restart()
        {
            tracing::info!(server = %connection.name(), "transport closed, restarting per policy");
            if let Err(err) = connection.restart().await {
                tracing::warn!(server = %connection.name(), error = %err, "restart failed");
            }
        }
        result
    }
}
