//! Request/response mapping between tether types and the OpenAI
//! chat-completions format.

use serde_json::{Value, json};

use tether_types::{
    CompletionRequest, CompletionResponse, FinishReason, Message, ProviderError, Role, ToolCall,
    Usage,
};

/// Convert a [`CompletionRequest`] into the chat-completions JSON body.
#[must_use]
pub fn to_api_request(req: &CompletionRequest, default_model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
    if !req.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": req.system_prompt}));
    }
    messages.extend(req.messages.iter().map(map_message));

    let mut body = json!({
        "model": default_model,
        "messages": messages,
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
    if let Some(temperature) = req.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = req.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if req.stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
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
                    json!({
                        "id": call.id,
                        "type": call.call_type,
                        "function": {
                            "name": call.function.name,
                            "arguments": call.function.arguments,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

/// Parse a chat-completions response body.
///
/// # Errors
///
/// [`ProviderError::InvalidResponse`] when no choice is present.
pub fn from_api_response(body: &Value) -> Result<CompletionResponse, ProviderError> {
    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;
    let message = &choice["message"];

    let tool_calls = parse_tool_calls(message["tool_calls"].as_array());
    let finish_reason = parse_finish_reason(choice["finish_reason"].as_str(), &tool_calls);

    Ok(CompletionResponse {
        text: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        usage: parse_usage(&body["usage"]),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        finish_reason,
    })
}

/// Parse the tool-call side array. Raw argument strings are preserved.
pub(crate) fn parse_tool_calls(calls: Option<&Vec<Value>>) -> Vec<ToolCall> {
    calls
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let name = call["function"]["name"].as_str()?;
                    Some(ToolCall::function(
                        call["id"].as_str().unwrap_or_default(),
                        name,
                        call["function"]["arguments"].as_str().unwrap_or("{}"),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    }
}

pub(crate) fn parse_finish_reason(reason: Option<&str>, tool_calls: &[ToolCall]) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("stop") => FinishReason::Stop,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::ToolDefinition;

    fn request_with(messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest { messages, ..CompletionRequest::default() }
    }

    #[test]
    fn system_prompt_becomes_leading_message() {
        let mut req = request_with(vec![Message::user("hi")]);
        req.system_prompt = "be brief".into();
        let body = to_api_request(&req, "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn empty_system_prompt_adds_nothing() {
        let body = to_api_request(&request_with(vec![Message::user("hi")]), "gpt-4o");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_schema_passes_through_verbatim() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string", "pattern": "^/"}},
            "additionalProperties": false,
            "x-vendor-extension": {"weird": [1, 2]},
        });
        let mut req = request_with(vec![Message::user("hi")]);
        req.tools = vec![ToolDefinition {
            name: "fs_list".into(),
            description: "list".into(),
            parameters: schema.clone(),
        }];
        let body = to_api_request(&req, "gpt-4o");
        assert_eq!(body["tools"][0]["function"]["parameters"], schema);
    }

    #[test]
    fn assistant_tool_calls_and_tool_results_map() {
        let req = request_with(vec![
            Message::assistant_with_calls(
                "",
                vec![ToolCall::function("c1", "fs_list", r#"{"path":"/"}"#)],
            ),
            Message::tool("c1", "file.txt"),
        ]);
        let body = to_api_request(&req, "gpt-4o");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tool_calls"][0]["id"], "c1");
        assert_eq!(messages[0]["tool_calls"][0]["function"]["arguments"], r#"{"path":"/"}"#);
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "c1");
    }

    #[test]
    fn stream_flag_adds_usage_option() {
        let mut req = request_with(vec![Message::user("hi")]);
        req.stream = true;
        let body = to_api_request(&req, "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn response_text_only() {
        let body = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15},
        });
        let response = from_api_response(&body).unwrap();
        assert_eq!(response.text, "hello");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[test]
    fn response_with_tool_calls() {
        let body = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "fs_list", "arguments": "{\"path\":\"/\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        });
        let response = from_api_response(&body).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_abc");
        assert_eq!(response.tool_calls[0].function.arguments, "{\"path\":\"/\"}");
    }

    #[test]
    fn missing_choices_is_invalid_response() {
        assert!(matches!(
            from_api_response(&json!({"usage": {}})),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}
