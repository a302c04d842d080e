//! NDJSON streaming for `/api/chat`.
//!
//! One JSON object per line; `done: true` carries usage and the stop
//! reason. Tool calls may arrive in any chunk.

use futures::StreamExt;
use serde_json::Value;

use tether_types::{CompletionResponse, FinishReason, ProviderError, StreamSink, ToolCall, Usage};

use crate::mapping::{detect_inline_tool_calls, parse_native_tool_calls, parse_usage};

#[derive(Default)]
struct StreamState {
    text: String,
    model: String,
    usage: Usage,
    done_reason: Option<String>,
    tool_calls: Vec<ToolCall>,
}

impl StreamState {
    /// Apply one NDJSON line; returns text to push, if any.
    fn apply(&mut self, line: &Value) -> Option<String> {
        if let Some(model) = line["model"].as_str() {
            self.model = model.to_string();
        }
        let message = &line["message"];
        let native = parse_native_tool_calls(message["tool_calls"].as_array());
        for call in native {
            // Re-key ids so calls from different chunks stay unique.
            self.tool_calls.push(ToolCall::function(
                format!("ollama_call_{}", self.tool_calls.len()),
                call.function.name,
                call.function.arguments,
            ));
        }
        if line["done"].as_bool() == Some(true) {
            self.usage = parse_usage(line);
            if let Some(reason) = line["done_reason"].as_str() {
                self.done_reason = Some(reason.to_string());
            }
        }
        let content = message["content"].as_str().unwrap_or_default();
        if content.is_empty() {
            return None;
        }
        self.text.push_str(content);
        Some(content.to_string())
    }

    fn finish(self) -> CompletionResponse {
        let mut text = self.text;
        let mut tool_calls = self.tool_calls;
        if tool_calls.is_empty() {
            let (detected, remainder) = detect_inline_tool_calls(&text);
            if !detected.is_empty() {
                tool_calls = detected;
                text = remainder;
            }
        }
        let finish_reason = match self.done_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        CompletionResponse { text, tool_calls, usage: self.usage, model: self.model, finish_reason }
    }
}

/// Consume the NDJSON stream, pushing text into `sink`.
///
/// # Errors
///
/// [`ProviderError::Stream`] on transport or decode failures.
pub(crate) async fn run_stream(
    response: reqwest::Response,
    sink: &mut dyn StreamSink,
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
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)
                .map_err(|e| ProviderError::Stream(format!("line parse: {e}")))?;
            if let Some(delta) = state.apply(&value) {
                sink.push(&delta).await?;
            }
        }
    }
    Ok(state.finish())
}
