//! Conversation and tool types.
//!
//! These are the internal lingua franca: not provider wire types and not
//! JSON-RPC frames. Provider crates convert to and from these; the host
//! converts tool-server catalogs into [`ToolDefinition`]s.

use serde::{Deserialize, Serialize};

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// A human user.
    User,
    /// The model.
    Assistant,
    /// A tool result being fed back to the model.
    Tool,
}

/// A message in a conversation.
///
/// A `tool` message carries the `tool_call_id` of the assistant tool call
/// it answers; every other role leaves it `None`. An assistant message
/// that requested tools carries the calls in `tool_calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// Text content. May be empty for an assistant message that only
    /// issues tool calls.
    pub content: String,
    /// Tool calls issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` messages: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into(), tool_calls: vec![], tool_call_id: None }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into(), tool_calls: vec![], tool_call_id: None }
    }

    /// Create a plain-text assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into(), tool_calls: vec![], tool_call_id: None }
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: Role::Assistant, content: text.into(), tool_calls, tool_call_id: None }
    }

    /// Create a tool-result message answering `tool_call_id`.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call issued by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the parent assistant message.
    pub id: String,
    /// Call type. Always `"function"` today.
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function being called.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a function tool call.
    #[must_use]
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
        }
    }

    /// Parse the raw argument string into a JSON object.
    ///
    /// Empty or whitespace-only arguments parse as `{}`. Anything that is
    /// valid JSON but not an object is rejected.
    ///
    /// # Errors
    ///
    /// Returns the parse failure or a type mismatch as a string suitable
    /// for feeding back to the model as a tool error.
    pub fn parsed_arguments(&self) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(serde_json::Map::new());
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("invalid tool arguments: {e}"))?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(format!("tool arguments must be a JSON object, got {other}")),
        }
    }
}

/// The function portion of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Wire name of the tool.
    pub name: String,
    /// Raw JSON arguments, exactly as the provider produced them.
    pub arguments: String,
}

/// A tool advertised to the model.
///
/// `parameters` is the origin server's JSON Schema, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Wire-unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input. Never rewritten.
    pub parameters: serde_json::Value,
}

/// One block in a tool result's content array.
///
/// Mirrors the wire shape `{type, text?, data?, mimeType?}` so unknown
/// block types survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    /// Block type: `"text"`, `"image"`, or any future type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 payload for binary blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// MIME type for binary blocks.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
}

impl ToolContent {
    /// Create a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self { kind: "text".into(), text: Some(text.into()), data: None, mime_type: None }
    }

    /// Create an image block.
    #[must_use]
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: "image".into(),
            text: None,
            data: Some(data.into()),
            mime_type: Some(mime_type.into()),
        }
    }
}

/// The outcome of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content blocks returned by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the invocation failed.
    pub is_error: bool,
    /// Error text, when the tool or server supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    /// A successful result with a single text block.
    #[must_use]
    pub fn ok_text(text: impl Into<String>) -> Self {
        Self { content: vec![ToolContent::text(text)], is_error: false, error: None }
    }

    /// A failed result carrying an error message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: vec![ToolContent::text(message.clone())],
            is_error: true,
            error: Some(message),
        }
    }

    /// Join all text blocks with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A completion request to an LLM provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Conversation messages, already trimmed and pairing-validated.
    pub messages: Vec<Message>,
    /// Tools available to the model, with wire names.
    pub tools: Vec<ToolDefinition>,
    /// System prompt. May be empty when already present as a `system`
    /// message in `messages`.
    pub system_prompt: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Whether the caller wants streamed delivery.
    pub stream: bool,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural completion.
    Stop,
    /// Hit the output token limit.
    Length,
    /// The model issued tool calls.
    ToolCalls,
}

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
    /// Prompt + completion.
    pub total_tokens: u64,
}

impl Usage {
    /// Accumulate another call's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A completion response from an LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The generated text.
    pub text: String,
    /// Tool calls the model issued, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this call.
    pub usage: Usage,
    /// The model that generated the response.
    pub model: String,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// A text-only response, for tests and simple paths.
    #[must_use]
    pub fn text_only(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: vec![],
            usage: Usage::default(),
            model: model.into(),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }

    #[test]
    fn message_roundtrip_skips_empty_fields() {
        let msg = Message::user("hi");
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("tool_calls").is_none());
        assert!(value.get("tool_call_id").is_none());
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = Message::tool("call_1", "result");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn tool_call_wire_shape() {
        let call = ToolCall::function("call_1", "fs_list", r#"{"path":"/"}"#);
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "fs_list");
    }

    #[test]
    fn empty_arguments_parse_as_object() {
        let call = ToolCall::function("c", "t", "");
        assert!(call.parsed_arguments().unwrap().is_empty());
        let call = ToolCall::function("c", "t", "   ");
        assert!(call.parsed_arguments().unwrap().is_empty());
    }

    #[test]
    fn non_object_arguments_rejected() {
        let call = ToolCall::function("c", "t", "[1,2]");
        assert!(call.parsed_arguments().is_err());
        let call = ToolCall::function("c", "t", "not json");
        assert!(call.parsed_arguments().is_err());
    }

    #[test]
    fn tool_content_wire_shape() {
        let block = ToolContent::image("AAAA", "image/png");
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value, json!({"type": "image", "data": "AAAA", "mimeType": "image/png"}));
    }

    #[test]
    fn unknown_content_kind_roundtrips() {
        let value = json!({"type": "resource", "text": "x"});
        let block: ToolContent = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(block.kind, "resource");
        assert_eq!(serde_json::to_value(&block).unwrap(), value);
    }

    #[test]
    fn tool_result_text_joins_blocks() {
        let result = ToolResult {
            content: vec![
                ToolContent::text("a"),
                ToolContent::image("AA", "image/png"),
                ToolContent::text("b"),
            ],
            is_error: false,
            error: None,
        };
        assert_eq!(result.text(), "a\nb");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
        total.add(&Usage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 });
        assert_eq!(total.total_tokens, 18);
    }
}
