//! JSON-RPC 2.0 frame model and line codec.
//!
//! One frame per line, UTF-8, terminated by `\n`. Classification follows
//! the id/method rules: a request has a non-null `id` and a `method`, a
//! notification has a `method` and no (or null) `id`, and a response has
//! an `id` plus exactly one of `result`/`error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_types::RpcError;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Largest frame the codec accepts, comfortably above the 1 MiB floor
/// the protocol guarantees.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// A JSON-RPC id: integer, string, or null (only valid on error
/// responses to unparseable input).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Integer id. The dispatcher allocates these.
    Number(i64),
    /// String id, accepted from peers.
    Text(String),
    /// Null id, used when answering a frame whose id was unreadable.
    Null,
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        RpcId::Number(n as i64)
    }
}

/// The error object of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Structured detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Build an error object.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

/// One classified JSON-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcFrame {
    /// A request expecting a response.
    Request {
        /// Correlation id.
        id: RpcId,
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
    /// A response to an earlier request.
    Response {
        /// The id of the request being answered.
        id: RpcId,
        /// Success payload. Mutually exclusive with `error`.
        result: Option<Value>,
        /// Failure payload. Mutually exclusive with `result`.
        error: Option<RpcErrorObject>,
    },
    /// A one-way message. MUST never be answered.
    Notification {
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
}

impl RpcFrame {
    /// Build a request frame.
    #[must_use]
    pub fn request(id: impl Into<RpcId>, method: impl Into<String>, params: Option<Value>) -> Self {
        RpcFrame::Request { id: id.into(), method: method.into(), params }
    }

    /// Build a notification frame.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        RpcFrame::Notification { method: method.into(), params }
    }

    /// Build a success response.
    #[must_use]
    pub fn response_ok(id: RpcId, result: Value) -> Self {
        RpcFrame::Response { id, result: Some(result), error: None }
    }

    /// Build an error response.
    #[must_use]
    pub fn response_err(id: RpcId, error: RpcErrorObject) -> Self {
        RpcFrame::Response { id, result: None, error: Some(error) }
    }

    /// The method name, for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            RpcFrame::Request { method, .. } | RpcFrame::Notification { method, .. } => {
                Some(method)
            }
            RpcFrame::Response { .. } => None,
        }
    }
}

/// Serialize a frame to a single line including the trailing newline.
#[must_use]
pub fn encode_frame(frame: &RpcFrame) -> String {
    let value = match frame {
        RpcFrame::Request { id, method, params } => {
            let mut obj = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
            });
            if let Some(params) = params {
                obj["params"] = params.clone();
            }
            obj
        }
        RpcFrame::Notification { method, params } => {
            let mut obj = serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
            });
            if let Some(params) = params {
                obj["params"] = params.clone();
            }
            obj
        }
        RpcFrame::Response { id, result, error } => {
            let mut obj = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
            });
            match (result, error) {
                (_, Some(err)) => {
                    obj["error"] = serde_json::to_value(err).unwrap_or(Value::Null);
                }
                (Some(res), None) => obj["result"] = res.clone(),
                // A response must carry one of the two; encode an empty
                // result rather than an invalid frame.
                (None, None) => obj["result"] = Value::Null,
            }
            obj
        }
    };
    let mut line = value.to_string();
    line.push('\n');
    line
}

/// Parse and classify one line.
///
/// # Errors
///
/// [`RpcError::FrameTooLarge`] above [`MAX_FRAME_BYTES`];
/// [`RpcError::Parse`] for invalid JSON or a shape that is none of
/// request / response / notification.
pub fn decode_line(line: &str) -> Result<RpcFrame, RpcError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(line.len()));
    }
    let value: Value =
        serde_json::from_str(line.trim_end()).map_err(|e| RpcError::Parse(e.to_string()))?;
    classify(value)
}

/// Classify an already-parsed JSON value into a frame.
///
/// # Errors
///
/// [`RpcError::Parse`] when the value is not a JSON-RPC frame.
pub fn classify(value: Value) -> Result<RpcFrame, RpcError> {
    let Value::Object(mut obj) = value else {
        return Err(RpcError::Parse("frame is not a JSON object".into()));
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => Some(RpcId::Number(n)),
            None => return Err(RpcError::Parse(format!("non-integer id: {n}"))),
        },
        Some(Value::String(s)) => Some(RpcId::Text(s)),
        Some(other) => return Err(RpcError::Parse(format!("invalid id: {other}"))),
    };
    let method = match obj.remove("method") {
        Some(Value::String(m)) => Some(m),
        Some(other) => return Err(RpcError::Parse(format!("invalid method: {other}"))),
        None => None,
    };
    let params = obj.remove("params");
    let result = obj.remove("result");
    let error = obj.remove("error");

    match (id, method) {
        (Some(id), Some(method)) => Ok(RpcFrame::Request { id, method, params }),
        (None, Some(method)) => Ok(RpcFrame::Notification { method, params }),
        (Some(id), None) => {
            let error = match error {
                Some(value) => Some(
                    serde_json::from_value::<RpcErrorObject>(value)
                        .map_err(|e| RpcError::Parse(format!("invalid error object: {e}")))?,
                ),
                None => None,
            };
            if result.is_some() == error.is_some() {
                return Err(RpcError::Parse(
                    "response must carry exactly one of result/error".into(),
                ));
            }
            Ok(RpcFrame::Response { id, result, error })
        }
        (None, None) => Err(RpcError::Parse("frame has neither id nor method".into())),
    }
}
