//! Request/response mapping for the Anthropic Messages API.
//!
//! Anthropic differs from the chat-completions shape in three ways that
//! matter here: the system prompt is a top-level field, tool uses are
//! typed content blocks inside the assistant message, and tool results
//! travel as `tool_result` blocks inside a `user` message.

use serde_json::{Value, json};

use tether_types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, ProviderError, Role, ToolCall,
    Usage,
};

/// Output-token ceiling applied when the request does not set one; the
/// Messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Convert a [`CompletionRequest`] into a Messages API body.
#[must_use]
pub fn to_api_request(req: &CompletionRequest, default_model: &str) -> Value {
    let mut system = req.system_prompt.clone();
    let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len());

    for message in &req.messages {
        match message.role {
            // System messages fold into the top-level system field.
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&message.content);
            }
            Role::User => {
                messages.push(json!({"role": "user", "content": message.content}));
            }
            Role::Assistant => messages.push(map_assistant(message)),
            Role::Tool => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content,
                    }],
                }));
            }
        }
    }

    let mut body = json!({
        "model": default_model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(
            req.tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect(),
        );
    }
    if let Some(temperature) = req.temperature {
        body["temperature"] = json!(temperature);
    }
    if req.stream {
        body["stream"] = json!(true);
    }
    body
}

fn map_assistant(message: &Message) -> Value {
    let mut blocks: Vec<Value> = Vec::new();
    if !message.content.is_empty() {
        blocks.push(json!({"type": "text", "text": message.content}));
    }
    for call in &message.tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }
    json!({"role": "assistant", "content": blocks})
}

/// Parse a Messages API response body.
///
/// # Errors
///
/// [`ProviderError::InvalidResponse`] when the content array is absent.
pub fn from_api_response(body: &Value) -> Result<CompletionResponse, ProviderError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("response has no content".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => {
                tool_calls.push(ToolCall::function(
                    block["id"].as_str().unwrap_or_default(),
                    block["name"].as_str().unwrap_or_default(),
                    block["input"].to_string(),
                ));
            }
            _ => {}
        }
    }

    Ok(CompletionResponse {
        text,
        tool_calls,
        usage: parse_usage(&body["usage"]),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        finish_reason: parse_stop_reason(body["stop_reason"].as_str()),
    })
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    let prompt = usage["input_tokens"].as_u64().unwrap_or(0);
    let completion = usage["output_tokens"].as_u64().unwrap_or(0);
    Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
}

pub(crate) fn parse_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}
