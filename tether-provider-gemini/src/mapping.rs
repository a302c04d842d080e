//! Request/response mapping for Gemini's content-parts model.
//!
//! Gemini has no tool-call ids: a `functionCall` part carries only a
//! name and args, and the answering `functionResponse` part carries the
//! name again. Ids are synthesized on the way out and resolved back to
//! function names on the way in.

use std::collections::HashMap;

use serde_json::{Value, json};

use tether_types::{
    CompletionRequest, CompletionResponse, FinishReason, ProviderError, Role, ToolCall, Usage,
};

/// Convert a [`CompletionRequest`] into a generateContent body.
#[must_use]
pub fn to_api_request(req: &CompletionRequest) -> Value {
    // functionResponse parts need the function *name*; recover it from
    // the assistant message that declared each call id.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for message in &req.messages {
        for call in &message.tool_calls {
            call_names.insert(call.id.as_str(), call.function.name.as_str());
        }
    }

    let mut system = req.system_prompt.clone();
    let mut contents: Vec<Value> = Vec::with_capacity(req.messages.len());

    for message in &req.messages {
        match message.role {
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&message.content);
            }
            Role::User => {
                contents.push(json!({"role": "user", "parts": [{"text": message.content}]}));
            }
            Role::Assistant => {
                let mut parts: Vec<Value> = Vec::new();
                if !message.content.is_empty() {
                    parts.push(json!({"text": message.content}));
                }
                for call in &message.tool_calls {
                    let args: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    parts.push(json!({
                        "functionCall": {"name": call.function.name, "args": args}
                    }));
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            Role::Tool => {
                let name = message
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id).copied())
                    .unwrap_or_default();
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"result": message.content},
                        }
                    }],
                }));
            }
        }
    }

    let mut body = json!({"contents": contents});
    if !system.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if !req.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect::<Vec<Value>>(),
        }]);
    }
    let mut generation = serde_json::Map::new();
    if let Some(temperature) = req.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = req.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

/// Parse a generateContent response body.
///
/// # Errors
///
/// [`ProviderError::InvalidResponse`] when no candidate is present.
pub fn from_api_response(body: &Value, model: &str) -> Result<CompletionResponse, ProviderError> {
    let candidate = body["candidates"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("response has no candidates".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if part["functionCall"].is_object() {
                let call = &part["functionCall"];
                tool_calls.push(ToolCall::function(
                    format!("gemini_call_{}", tool_calls.len()),
                    call["name"].as_str().unwrap_or_default(),
                    call["args"].to_string(),
                ));
            }
        }
    }

    let finish_reason = match candidate["finishReason"].as_str() {
        Some("MAX_TOKENS") => FinishReason::Length,
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    Ok(CompletionResponse {
        text,
        tool_calls,
        usage: parse_usage(&body["usageMetadata"]),
        model: body["modelVersion"].as_str().unwrap_or(model).to_string(),
        finish_reason,
    })
}

pub(crate) fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
        completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
        total_tokens: usage["totalTokenCount"].as_u64().unwrap_or(0),
    }
}
