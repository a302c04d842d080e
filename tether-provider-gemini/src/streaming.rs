//! SSE streaming for `streamGenerateContent`.
//!
//! Each `data:` line carries a response-shaped chunk whose parts are
//! incremental: text parts stream, function calls arrive whole.

use futures::StreamExt;
use serde_json::Value;

use tether_types::{CompletionResponse, FinishReason, ProviderError, StreamSink, ToolCall, Usage};

use crate::mapping::parse_usage;

#[derive(Default)]
struct StreamState {
    text: String,
    model: String,
    usage: Usage,
    finish_reason: Option<String>,
    calls: Vec<(String, String)>,
}

impl StreamState {
    /// Apply one chunk; returns text to push, if any.
    fn apply(&mut self, chunk: &Value) -> Option<String> {
        if let Some(model) = chunk["modelVersion"].as_str() {
            self.model = model.to_string();
        }
        if chunk["usageMetadata"].is_object() {
            self.usage = parse_usage(&chunk["usageMetadata"]);
        }
        let candidate = chunk["candidates"].get(0)?;
        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        let mut pushed = String::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    self.text.push_str(text);
                    pushed.push_str(text);
                }
                if part["functionCall"].is_object() {
                    let call = &part["functionCall"];
                    self.calls.push((
                        call["name"].as_str().unwrap_or_default().to_string(),
                        call["args"].to_string(),
                    ));
                }
            }
        }
        (!pushed.is_empty()).then_some(pushed)
    }

    fn finish(self, default_model: &str) -> CompletionResponse {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::function(format!("gemini_call_{i}"), name, args))
            .collect();
        let finish_reason = match self.finish_reason.as_deref() {
            Some("MAX_TOKENS") => FinishReason::Length,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        CompletionResponse {
            text: self.text,
            tool_calls,
            usage: self.usage,
            model: if self.model.is_empty() { default_model.to_string() } else { self.model },
            finish_reason,
        }
    }
}

/// Consume the SSE stream, pushing text into `sink`.
///
/// # Errors
///
/// [`ProviderError::Stream`] on transport or decode failures.
pub(crate) async fn run_stream(
    response: reqwest::Response,
    sink: &mut dyn StreamSink,
    default_model: &str,
) -> Result<CompletionResponse, ProviderError> {
    let mut state = StreamState::default();
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = chunk.map_err(|e| ProviderError::Stream(format!("stream read: {e}")))?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| ProviderError::Stream(format!("utf-8 decode: {e}")))?;
        buffer.push_str(text);

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);
            let Some(data) = line.strip_prefix("data:").map(str::trim) else { continue };
            if data.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(data)
                .map_err(|e| ProviderError::Stream(format!("chunk parse: {e}")))?;
            if let Some(delta) = state.apply(&value) {
                sink.push(&delta).await?;
            }
        }
    }
    Ok(state.finish(default_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunks_aggregate_text_and_finish() {
        let mut state = StreamState::default();
        let chunks = [
            json!({"candidates": [{"content": {"parts": [{"text": "par"}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "tial"}]}, "finishReason": "STOP"}],
                   "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3, "totalTokenCount": 5}}),
        ];
        let mut pushed = String::new();
        for chunk in &chunks {
            if let Some(delta) = state.apply(chunk) {
                pushed.push_str(&delta);
            }
        }
        let response = state.finish("gemini-1.5-flash");
        assert_eq!(pushed, "partial");
        assert_eq!(response.text, "partial");
        assert_eq!(response.usage.total_tokens, 5);
        assert_eq!(response.model, "gemini-1.5-flash");
    }

    #[test]
    fn function_calls_collect_across_chunks() {
        let mut state = StreamState::default();
        state.apply(&json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "a", "args": {}}}
        ]}}]}));
        state.apply(&json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "b", "args": {"x": 1}}}
        ]}, "finishReason": "STOP"}]}));
        let response = state.finish("m");
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_ne!(response.tool_calls[0].id, response.tool_calls[1].id);
    }
}
