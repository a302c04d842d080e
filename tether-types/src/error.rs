//! Error types for all tether crates.

use std::time::Duration;

/// Errors from LLM provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    // Retryable errors
    /// Network-level error (connection reset, DNS failure, etc.).
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Rate limited by the provider.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit {
        /// Suggested retry delay, if provided by the API.
        retry_after: Option<Duration>,
    },
    /// Request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// Provider service is temporarily unavailable (5xx).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Terminal errors
    /// Authentication/authorization failure.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Malformed or invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Requested model does not exist.
    #[error("model not found: {0}")]
    ModelNotFound(String),
    /// Could not parse the provider's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    // Catch-all
    /// Error during streaming.
    #[error("stream error: {0}")]
    Stream(String),
    /// The call was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// Any other provider error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
    /// Whether this error is likely transient and the request can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimit { .. } | Self::Timeout(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Classify an HTTP status code into the taxonomy.
    ///
    /// `body` feeds the error message; it is not inspected.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            404 => Self::ModelNotFound(body),
            429 => Self::RateLimit { retry_after: None },
            400 | 422 => Self::InvalidRequest(body),
            s if s >= 500 => Self::ServiceUnavailable(format!("HTTP {s}: {body}")),
            s => Self::InvalidRequest(format!("HTTP {s}: {body}")),
        }
    }
}

/// Errors from the JSON-RPC codec, transports, and dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A frame could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// A frame exceeded the maximum accepted size.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// The peer returned a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message.
        message: String,
        /// Structured error data, if any.
        data: Option<serde_json::Value>,
    },
    /// The request deadline elapsed.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// The transport closed while requests were in flight.
    #[error("transport closed")]
    TransportClosed,
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The call was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Errors from the tool-server host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The child process could not be spawned.
    #[error("spawn failed for {server}: {source}")]
    Spawn {
        /// Server name from configuration.
        server: String,
        /// Underlying spawn failure.
        #[source]
        source: std::io::Error,
    },
    /// The initialize handshake failed.
    #[error("initialization failed for {server}: {reason}")]
    Initialization {
        /// Server name.
        server: String,
        /// What went wrong.
        reason: String,
    },
    /// Tool discovery failed after all retries.
    #[error("tool discovery failed for {server}: {reason}")]
    Discovery {
        /// Server name.
        server: String,
        /// What went wrong.
        reason: String,
    },
    /// A tool invocation failed.
    #[error("tool call {tool} failed: {reason}")]
    ToolCall {
        /// Wire name of the tool.
        tool: String,
        /// Error text extracted from the response.
        reason: String,
    },
    /// A wire name did not resolve to a known server.
    #[error("no server matches tool name: {0}")]
    UnknownTool(String),
    /// Two configured servers produce the same wire prefix.
    #[error("ambiguous wire name {wire}: servers {first} and {second} collide")]
    WireCollision {
        /// The colliding wire name.
        wire: String,
        /// First server involved.
        first: String,
        /// Second server involved.
        second: String,
    },
    /// The server is not in a state that can serve the request.
    #[error("server {server} is {state}")]
    NotReady {
        /// Server name.
        server: String,
        /// Current state, for the message.
        state: String,
    },
    /// The remaining deadline is below the minimum slice.
    #[error("insufficient time remaining for tool call ({0:?} left)")]
    DeadlineTooTight(Duration),
    /// Underlying RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Errors from the tool-dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Provider call failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// Host-level failure outside a single tool call.
    #[error("host error: {0}")]
    Host(#[from] HostError),
    /// The loop was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Errors from template parsing and execution.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The YAML could not be parsed or failed validation.
    #[error("template parse error: {0}")]
    Parse(String),
    /// A `{{path}}` reference did not resolve.
    #[error("undefined variable: {0}")]
    VariableMissing(String),
    /// A value had the wrong type for the operation.
    #[error("type mismatch in {context}: expected {expected}")]
    TypeMismatch {
        /// Where the mismatch occurred (step or expression).
        context: String,
        /// What the operation required.
        expected: String,
    },
    /// A step referenced an unknown template.
    #[error("template not found: {0}")]
    NotFound(String),
    /// Sub-template calls nested too deep.
    #[error("call depth exceeded ({0})")]
    CallDepthExceeded(usize),
    /// A step failed and its policy said stop.
    #[error("step {step} failed: {reason}")]
    StepFailed {
        /// The failing step's name.
        step: String,
        /// What went wrong.
        reason: String,
    },
    /// Provider call inside a step failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// Execution was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Errors from the exposed-as-server surface.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Binding the socket failed.
    #[error("bind failed at {path}: {source}")]
    Bind {
        /// Socket path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// Underlying RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// A referenced task does not exist.
    #[error("unknown task: {0}")]
    UnknownTask(String),
}

/// Errors from component assembly.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A referenced entity does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Entity kind ("provider", "template", "server").
        kind: &'static str,
        /// The missing name.
        name: String,
    },
    /// A provider family tag was not recognized.
    #[error("unknown provider type: {0}")]
    UnknownProviderType(String),
    /// A required secret was absent from the environment.
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    /// Configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
