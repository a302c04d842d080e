//! The JSON-RPC server surface.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use tether_rpc::codec::{
    INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, RpcErrorObject, RpcFrame, RpcId,
};
use tether_rpc::transport::{SocketListener, StdioTransport, Transport};
use tether_template::TemplateEngine;
use tether_template::vars::value_to_string;
use tether_types::{RpcError, ServeError, TemplateError};

use crate::tasks::{TaskStatus, TaskTable};

/// Protocol revision accepted and advertised.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One argument a tool exposure advertises.
#[derive(Debug, Clone)]
pub struct ExposedArg {
    /// Property name in the tool's input schema.
    pub name: String,
    /// Description shown to callers.
    pub description: String,
    /// Whether the schema marks it required.
    pub required: bool,
}

/// A template exported as a callable tool.
#[derive(Debug, Clone)]
pub struct ToolExposure {
    /// Wire tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Template invoked by calls.
    pub template: String,
    /// Declared arguments; empty means a single free-form `input_data`.
    pub arguments: Vec<ExposedArg>,
    /// Named engine (provider) override; `None` uses the default engine.
    pub provider: Option<String>,
}

impl ToolExposure {
    /// The advertised input schema.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        if self.arguments.is_empty() {
            return json!({
                "type": "object",
                "properties": {
                    "input_data": {"type": "string", "description": "Input passed to the template"}
                },
            });
        }
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.arguments {
            properties.insert(
                arg.name.clone(),
                json!({"type": "string", "description": arg.description}),
            );
            if arg.required {
                required.push(Value::String(arg.name.clone()));
            }
        }
        json!({"type": "object", "properties": properties, "required": required})
    }

    /// Map call arguments onto the template's `input_data`.
    #[must_use]
    pub fn input_from_arguments(&self, mut arguments: Map<String, Value>) -> Value {
        if self.arguments.is_empty() {
            return match arguments.remove("input_data") {
                Some(value) => value,
                None => Value::Object(arguments),
            };
        }
        let mapped: Map<String, Value> = self
            .arguments
            .iter()
            .filter_map(|arg| arguments.remove(&arg.name).map(|v| (arg.name.clone(), v)))
            .collect();
        Value::Object(mapped)
    }
}

/// Server identity and behavior knobs.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Advertised server name.
    pub name: String,
    /// Advertised version.
    pub version: String,
    /// Progress heartbeat interval for long calls.
    pub heartbeat_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            name: "tether".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

/// Serves configured template exposures as tools over JSON-RPC.
pub struct TemplateServer {
    engine: Arc<TemplateEngine>,
    engines: std::collections::HashMap<String, Arc<TemplateEngine>>,
    exposures: Vec<ToolExposure>,
    tasks: Arc<TaskTable>,
    options: ServeOptions,
}

impl TemplateServer {
    /// Create a server with a default engine.
    #[must_use]
    pub fn new(engine: Arc<TemplateEngine>, exposures: Vec<ToolExposure>, options: ServeOptions) -> Self {
        Self {
            engine,
            engines: std::collections::HashMap::new(),
            exposures,
            tasks: Arc::new(TaskTable::new()),
            options,
        }
    }

    /// Register a named engine for exposures carrying a provider
    /// override.
    #[must_use]
    pub fn with_engine(mut self, name: impl Into<String>, engine: Arc<TemplateEngine>) -> Self {
        self.engines.insert(name.into(), engine);
        self
    }

    /// The shared task table.
    #[must_use]
    pub fn tasks(&self) -> Arc<TaskTable> {
        Arc::clone(&self.tasks)
    }

    /// Serve this process's stdin/stdout until EOF.
    ///
    /// # Errors
    ///
    /// Transport failures as [`ServeError`].
    pub async fn serve_stdio(self: Arc<Self>) -> Result<(), ServeError> {
        self.serve_connection(Arc::new(StdioTransport::new())).await
    }

    /// Accept connections on a socket listener; each connection gets an
    /// independent serve loop.
    ///
    /// # Errors
    ///
    /// Accept failures as [`ServeError`].
    pub async fn serve_socket(self: Arc<Self>, listener: SocketListener) -> Result<(), ServeError> {
        loop {
            let transport = listener.accept().await.map_err(|source| ServeError::Bind {
                path: listener.path().display().to_string(),
                source,
            })?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.serve_connection(Arc::new(transport)).await {
                    tracing::warn!(error = %err, "connection closed with error");
                }
            });
        }
    }

    /// Serve one transport until the peer closes it.
    ///
    /// Requests are handled concurrently (each in its own task) so a
    /// long `tools/call` does not block `tasks/cancel` on the same
    /// connection. Notifications are consumed and never answered.
    ///
    /// # Errors
    ///
    /// Currently none beyond loop exit; reserved for transport setup.
    pub async fn serve_connection(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), ServeError> {
        while let Some(received) = transport.recv().await {
            match received {
                Ok(RpcFrame::Request { id, method, params }) => {
                    let server = Arc::clone(self);
                    let transport = Arc::clone(&transport);
                    tokio::spawn(async move {
                        let frame = match server.handle(&method, params, &transport).await {
                            Ok(result) => RpcFrame::response_ok(id, result),
                            Err(error) => RpcFrame::response_err(id, error),
                        };
                        if let Err(err) = transport.send(&frame).await {
                            tracing::warn!(error = %err, "failed to send response");
                        }
                    });
                }
                Ok(RpcFrame::Notification { method, .. }) => {
                    tracing::debug!(method, "notification received");
                }
                Ok(RpcFrame::Response { .. }) => {
                    tracing::warn!("unexpected response frame on server transport");
                }
                Err(RpcError::Parse(reason)) => {
                    tracing::warn!(%reason, "unparseable frame");
                    let frame = RpcFrame::response_err(
                        RpcId::Null,
                        RpcErrorObject::new(PARSE_ERROR, reason),
                    );
                    let _ = transport.send(&frame).await;
                }
                Err(err) => tracing::warn!(error = %err, "receive error"),
            }
        }
        Ok(())
    }

    async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        transport: &Arc<dyn Transport>,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.options.name, "version": self.options.version},
            })),
            "tools/list" => Ok(json!({
                "tools": self
                    .exposures
                    .iter()
                    .map(|exposure| {
                        json!({
                            "name": exposure.name,
                            "description": exposure.description,
                            "inputSchema": exposure.input_schema(),
                        })
                    })
                    .collect::<Vec<Value>>(),
            })),
            "tools/call" => self.handle_tool_call(params.unwrap_or_default(), transport).await,
            "tasks/get" => {
                let task = self.lookup_task(&params)?;
                Ok(json!({"task": task}))
            }
            "tasks/result" => {
                let task = self.lookup_task(&params)?;
                match task.status {
                    TaskStatus::Done => Ok(json!({"result": task.result})),
                    TaskStatus::Failed => Ok(json!({"error": task.error})),
                    status => Err(RpcErrorObject::new(
                        INVALID_PARAMS,
                        format!("task {} is {status:?}", task.id),
                    )),
                }
            }
            "tasks/list" => Ok(json!({"tasks": self.tasks.list()})),
            "tasks/cancel" => {
                let id = task_id(&params)?;
                if self.tasks.cancel(&id) {
                    Ok(json!({"cancelled": true}))
                } else {
                    Err(RpcErrorObject::new(INVALID_PARAMS, format!("unknown task: {id}")))
                }
            }
            other => Err(RpcErrorObject::new(
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        }
    }

    async fn handle_tool_call(
        &self,
        params: Value,
        transport: &Arc<dyn Transport>,
    ) -> Result<Value, RpcErrorObject> {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        let Some(exposure) = self.exposures.iter().find(|e| e.name == name) else {
            return Err(RpcErrorObject::new(INVALID_PARAMS, format!("unknown tool: {name}")));
        };
        let arguments = params["arguments"].as_object().cloned().unwrap_or_default();
        let progress_token = params["_meta"]["progressToken"].clone();

        let (task_id, cancel) = self.tasks.create(&name);
        let heartbeat = (!progress_token.is_null()).then(|| {
            spawn_heartbeat(
                Arc::clone(transport),
                progress_token.clone(),
                self.options.heartbeat_interval,
            )
        });

        self.tasks.mark_running(&task_id);
        let engine = exposure
            .provider
            .as_ref()
            .and_then(|name| self.engines.get(name))
            .unwrap_or(&self.engine);
        let input = exposure.input_from_arguments(arguments);
        let outcome = engine.run(&exposure.template, input, &cancel).await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        if !progress_token.is_null() {
            let done = RpcFrame::notification(
                "notifications/progress",
                Some(json!({
                    "progressToken": progress_token,
                    "progress": 1.0,
                    "message": "complete",
                })),
            );
            let _ = transport.send(&done).await;
        }

        // Tool-level failures are results with isError, not protocol
        // errors; the caller's model sees the text either way.
        match outcome {
            Ok(value) => {
                self.tasks.mark_done(&task_id, value.clone());
                Ok(json!({
                    "content": [{"type": "text", "text": value_to_string(&value)}],
                    "isError": false,
                }))
            }
            Err(TemplateError::Cancelled) => {
                Ok(json!({
                    "content": [{"type": "text", "text": "cancelled"}],
                    "isError": true,
                }))
            }
            Err(err) => {
                let text = err.to_string();
                self.tasks.mark_failed(&task_id, text.clone());
                Ok(json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": true,
                }))
            }
        }
    }

    fn lookup_task(&self, params: &Option<Value>) -> Result<crate::tasks::TaskSnapshot, RpcErrorObject> {
        let id = task_id(params)?;
        self.tasks
            .get(&id)
            .ok_or_else(|| RpcErrorObject::new(INVALID_PARAMS, format!("unknown task: {id}")))
    }
}

fn task_id(params: &Option<Value>) -> Result<String, RpcErrorObject> {
    params
        .as_ref()
        .and_then(|p| p["taskId"].as_str())
        .map(ToString::to_string)
        .ok_or_else(|| RpcErrorObject::new(INVALID_PARAMS, "missing taskId".to_string()))
}

/// Emit `notifications/progress` on an interval until aborted. The
/// fraction climbs toward 0.9; completion sends the final 1.0.
fn spawn_heartbeat(
    transport: Arc<dyn Transport>,
    token: Value,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut tick = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            tick += 1;
            let progress = (f64::from(tick) * 0.1).min(0.9);
            let elapsed = started.elapsed().as_secs();
            let frame = RpcFrame::notification(
                "notifications/progress",
                Some(json!({
                    "progressToken": token,
                    "progress": progress,
                    "message": format!("still running ({elapsed}s elapsed)"),
                })),
            );
            if transport.send(&frame).await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure(arguments: Vec<ExposedArg>) -> ToolExposure {
        ToolExposure {
            name: "docs_summarize".into(),
            description: "Summarize documents".into(),
            template: "summarize".into(),
            arguments,
            provider: None,
        }
    }

    #[test]
    fn free_form_exposure_schema() {
        let schema = exposure(vec![]).input_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["input_data"].is_object());
    }

    #[test]
    fn declared_arguments_schema_marks_required() {
        let schema = exposure(vec![
            ExposedArg { name: "path".into(), description: "File".into(), required: true },
            ExposedArg { name: "style".into(), description: "Tone".into(), required: false },
        ])
        .input_schema();
        assert!(schema["properties"]["path"].is_object());
        assert_eq!(schema["required"], json!(["path"]));
    }

    #[test]
    fn free_form_input_prefers_input_data_key() {
        let exposure = exposure(vec![]);
        let mut args = Map::new();
        args.insert("input_data".into(), json!("payload"));
        assert_eq!(exposure.input_from_arguments(args), json!("payload"));

        let mut args = Map::new();
        args.insert("anything".into(), json!(1));
        assert_eq!(exposure.input_from_arguments(args), json!({"anything": 1}));
    }

    #[test]
    fn declared_arguments_are_projected() {
        let exposure = exposure(vec![ExposedArg {
            name: "path".into(),
            description: String::new(),
            required: true,
        }]);
        let mut args = Map::new();
        args.insert("path".into(), json!("/tmp"));
        args.insert("stray".into(), json!("dropped"));
        assert_eq!(exposure.input_from_arguments(args), json!({"path": "/tmp"}));
    }
}
