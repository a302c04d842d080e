//! SSE streaming for the Messages API.
//!
//! Anthropic's stream is event-typed: `message_start` carries input
//! usage, `content_block_start`/`content_block_delta`/`content_block_stop`
//! carry text and tool-use input fragments, `message_delta` carries the
//! stop reason and output usage.

use futures::StreamExt;
use serde_json::Value;

use tether_types::{CompletionResponse, ProviderError, StreamSink, ToolCall, Usage};

use crate::mapping::parse_stop_reason;

#[derive(Default)]
struct StreamState {
    text: String,
    model: String,
    usage: Usage,
    stop_reason: Option<String>,
    // Indexed by content-block index: (id, name, partial json).
    blocks: std::collections::HashMap<usize, (String, String, String)>,
}

impl StreamState {
    /// Apply one event; returns text to push into the sink, if any.
    fn apply(&mut self, event: &Value) -> Option<String> {
        match event["type"].as_str() {
            Some("message_start") => {
                let message = &event["message"];
                if let Some(model) = message["model"].as_str() {
                    self.model = model.to_string();
                }
                self.usage.prompt_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0);
                None
            }
            Some("content_block_start") => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let block = &event["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.blocks.insert(
                        index,
                        (
                            block["id"].as_str().unwrap_or_default().to_string(),
                            block["name"].as_str().unwrap_or_default().to_string(),
                            String::new(),
                        ),
                    );
                }
                None
            }
            Some("content_block_delta") => {
                let index = event["index"].as_u64().unwrap_or(0) as usize;
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        self.text.push_str(text);
                        (!text.is_empty()).then(|| text.to_string())
                    }
                    Some("input_json_delta") => {
                        if let Some(entry) = self.blocks.get_mut(&index) {
                            entry.2.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        None
                    }
                    _ => None,
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.completion_tokens = output;
                }
                None
            }
            Some("error") => {
                // Propagated by the caller via the returned Err; nothing
                // to aggregate here.
                None
            }
            _ => None,
        }
    }

    fn finish(self) -> CompletionResponse {
        let mut ordered: Vec<(usize, (String, String, String))> = self.blocks.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        let tool_calls: Vec<ToolCall> = ordered
            .into_iter()
            .map(|(_, (id, name, json))| {
                ToolCall::function(id, name, if json.is_empty() { "{}".into() } else { json })
            })
            .collect();
        let mut usage = self.usage;
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        CompletionResponse {
            text: self.text,
            tool_calls,
            usage,
            model: self.model,
            finish_reason: parse_stop_reason(self.stop_reason.as_deref()),
        }
    }
}

/// Consume an event stream, pushing text deltas into `sink`.
///
/// # Errors
///
/// [`ProviderError::Stream`] on transport failures or an in-band
/// `error` event. Pushed chunks are not retracted.
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
            let Some(data) = line.strip_prefix("data:").map(str::trim) else { continue };
            let event: Value = serde_json::from_str(data)
                .map_err(|e| ProviderError::Stream(format!("event parse: {e}")))?;
            if event["type"].as_str() == Some("error") {
                return Err(ProviderError::Stream(
                    event["error"]["message"].as_str().unwrap_or("stream error").to_string(),
                ));
            }
            if event["type"].as_str() == Some("message_stop") {
                return Ok(state.finish());
            }
            if let Some(delta) = state.apply(&event) {
                sink.push(&delta).await?;
            }
        }
    }
    Ok(state.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_types::FinishReason;

    #[test]
    fn event_sequence_aggregates_text_and_usage() {
        let mut state = StreamState::default();
        let events = [
            json!({"type": "message_start", "message": {"model": "claude-3-5-haiku-latest", "usage": {"input_tokens": 8}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": " there"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}}),
        ];
        let mut pushed = String::new();
        for event in &events {
            if let Some(delta) = state.apply(event) {
                pushed.push_str(&delta);
            }
        }
        let response = state.finish();
        assert_eq!(pushed, "Hi there");
        assert_eq!(response.text, "Hi there");
        assert_eq!(response.usage.prompt_tokens, 8);
        assert_eq!(response.usage.total_tokens, 11);
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn tool_use_input_fragments_assemble() {
        let mut state = StreamState::default();
        let events = [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "tu_1", "name": "fs_list"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"path\""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": ": \"/\"}"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 5}}),
        ];
        for event in &events {
            state.apply(event);
        }
        let response = state.finish();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "fs_list");
        let args: Value = serde_json::from_str(&response.tool_calls[0].function.arguments).unwrap();
        assert_eq!(args, json!({"path": "/"}));
    }

    #[test]
    fn empty_tool_input_defaults_to_object() {
        let mut state = StreamState::default();
        state.apply(&json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "tu", "name": "noop"}}));
        let response = state.finish();
        assert_eq!(response.tool_calls[0].function.arguments, "{}");
    }
}
