//! Request/response mapping for the Ollama chat API.
//!
//! Ollama's native tool calling mirrors the OpenAI shape but without
//! call ids (synthesized here). Models without native tool support often
//! emit `<tool_call>{...}</tool_call>` in free text instead; that
//! fallback is detected and promoted to real tool calls.

use serde_json::{Value, json};

use tether_types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, ProviderError, Role, ToolCall,
    Usage,
};

/// Convert a [`CompletionRequest`] into an `/api/chat` body.
///
/// `stream` is set explicitly by the caller.
#[must_use]
pub fn to_api_request(req: &CompletionRequest, default_model: &str, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
    if !req.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": req.system_prompt}));
    }
    messages.extend(req.messages.iter().map(map_message));

    let mut body = json!({
        "model": default_model,
        "messages": messages,
        "stream": stream,
    });
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(
            req.tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    let mut options = serde_json::Map::new();
    if let Some(temperature) = req.temperature {
        options.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = req.max_tokens {
        options.insert("num_predict".into(), json!(max_tokens));
    }
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    body
}

fn map_message(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut out = json!({"role": role, "content": message.content});
    if !message.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    let args: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    json!({"function": {"name": call.function.name, "arguments": args}})
                })
                .collect(),
        );
    }
    out
}

/// Parse an `/api/chat` response body.
///
/// # Errors
///
/// [`ProviderError::InvalidResponse`] when the `model` field is absent.
pub fn from_api_response(body: &Value) -> Result<CompletionResponse, ProviderError> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidResponse("response has no model".into()))?
        .to_string();

    let message = &body["message"];
    let mut text = message["content"].as_str().unwrap_or_default().to_string();
    let mut tool_calls = parse_native_tool_calls(message["tool_calls"].as_array());

    // Free-text fallback for models without native tool calling.
    if tool_calls.is_empty() {
        let (detected, remainder) = detect_inline_tool_calls(&text);
        if !detected.is_empty() {
            tool_calls = detected;
            text = remainder;
        }
    }

    let finish_reason = match body["done_reason"].as_str() {
        Some("length") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    Ok(CompletionResponse { text, tool_calls, usage: parse_usage(body), model, finish_reason })
}

pub(crate) fn parse_native_tool_calls(calls: Option<&Vec<Value>>) -> Vec<ToolCall> {
    calls
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, call)| {
                    let function = &call["function"];
                    let name = function["name"].as_str()?;
                    Some(ToolCall::function(
                        format!("ollama_call_{i}"),
                        name,
                        function["arguments"].to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_usage(body: &Value) -> Usage {
    let prompt = body["prompt_eval_count"].as_u64().unwrap_or(0);
    let completion = body["eval_count"].as_u64().unwrap_or(0);
    Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
}

/// Detect `<tool_call>{json}</tool_call>` segments in free text.
///
/// Returns the detected calls and the text with those segments removed.
/// A segment whose body is not a JSON object with a `name` is left in
/// the text untouched.
#[must_use]
pub fn detect_inline_tool_calls(text: &str) -> (Vec<ToolCall>, String) {
    const OPEN: &str = "<tool_call>";
    const CLOSE: &str = "</tool_call>";

    let mut calls = Vec::new();
    let mut remainder = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let body = after_open[..end].trim();
        let parsed: Option<(String, Value)> = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|value| {
                let name = value["name"].as_str()?.to_string();
                let args = value.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Some((name, args))
            });

        match parsed {
            Some((name, args)) => {
                remainder.push_str(&rest[..start]);
                calls.push(ToolCall::function(
                    format!("ollama_inline_{}", calls.len()),
                    name,
                    args.to_string(),
                ));
            }
            None => {
                // Keep the malformed segment visible in the text.
                remainder.push_str(&rest[..start + OPEN.len() + end + CLOSE.len()]);
            }
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    remainder.push_str(rest);
    (calls, remainder.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_tools_openai_style() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![tether_types::ToolDefinition {
                name: "fs_list".into(),
                description: "list".into(),
                parameters: json!({"type": "object"}),
            }],
            ..CompletionRequest::default()
        };
        let body = to_api_request(&req, "llama3.2", false);
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
        assert_eq!(body["tools"][0]["function"]["name"], "fs_list");
    }

    #[test]
    fn assistant_arguments_serialize_as_objects() {
        let req = CompletionRequest {
            messages: vec![Message::assistant_with_calls(
                "",
                vec![ToolCall::function("c", "t", r#"{"x":1}"#)],
            )],
            ..CompletionRequest::default()
        };
        let body = to_api_request(&req, "m", false);
        assert_eq!(body["messages"][0]["tool_calls"][0]["function"]["arguments"], json!({"x": 1}));
    }

    #[test]
    fn max_tokens_becomes_num_predict() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            max_tokens: Some(64),
            temperature: Some(0.2),
            ..CompletionRequest::default()
        };
        let body = to_api_request(&req, "m", false);
        assert_eq!(body["options"]["num_predict"], 64);
    }

    #[test]
    fn native_tool_calls_get_synthesized_ids() {
        let body = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "a", "arguments": {"x": 1}}},
                    {"function": {"name": "b", "arguments": {}}},
                ],
            },
            "done": true,
            "done_reason": "tool_calls",
            "prompt_eval_count": 5,
            "eval_count": 7,
        });
        let response = from_api_response(&body).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 2);
        assert_ne!(response.tool_calls[0].id, response.tool_calls[1].id);
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn inline_tool_call_detected_and_stripped() {
        let body = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "Sure.\n<tool_call>{\"name\": \"fs_list\", \"arguments\": {\"path\": \"/\"}}</tool_call>",
            },
            "done": true,
        });
        let response = from_api_response(&body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "fs_list");
        assert_eq!(response.text, "Sure.");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn malformed_inline_segment_stays_in_text() {
        let (calls, text) = detect_inline_tool_calls("before <tool_call>not json</tool_call> after");
        assert!(calls.is_empty());
        assert_eq!(text, "before <tool_call>not json</tool_call> after");
    }

    #[test]
    fn multiple_inline_calls_detected_in_order() {
        let input = "<tool_call>{\"name\":\"a\"}</tool_call><tool_call>{\"name\":\"b\",\"arguments\":{\"k\":2}}</tool_call>";
        let (calls, text) = detect_inline_tool_calls(input);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "a");
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[1].function.name, "b");
        assert!(text.is_empty());
    }

    #[test]
    fn no_markers_is_idempotent() {
        let (calls, text) = detect_inline_tool_calls("plain answer");
        assert!(calls.is_empty());
        assert_eq!(text, "plain answer");
    }
}
