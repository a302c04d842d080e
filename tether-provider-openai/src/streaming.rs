//! SSE streaming for the chat-completions endpoint.
//!
//! Delta chunks arrive as `data: {json}` lines; `data: [DONE]` ends the
//! stream. Text deltas go to the sink as they arrive; tool-call argument
//! fragments are stitched together by index.

use futures::StreamExt;
use serde_json::Value;

use tether_types::{
    CompletionResponse, FinishReason, ProviderError, StreamSink, ToolCall, Usage,
};

use crate::mapping::{parse_finish_reason, parse_usage};

#[derive(Default)]
struct StreamState {
    text: String,
    model: String,
    usage: Usage,
    finish_reason: Option<String>,
    // Indexed fragments: (id, name, argument buffer).
    calls: Vec<(String, String, String)>,
}

impl StreamState {
    fn apply(&mut self, chunk: &Value) {
        if let Some(model) = chunk["model"].as_str()
            && !model.is_empty()
        {
            self.model = model.to_string();
        }
        if chunk["usage"].is_object() {
            self.usage = parse_usage(&chunk["usage"]);
        }
        let Some(choice) = chunk["choices"].get(0) else { return };
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = &choice["delta"];
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                while self.calls.len() <= index {
                    self.calls.push((String::new(), String::new(), String::new()));
                }
                let slot = &mut self.calls[index];
                if let Some(id) = call["id"].as_str() {
                    slot.0 = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    slot.1.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    slot.2.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> CompletionResponse {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| {
                ToolCall::function(id, name, if args.is_empty() { "{}".into() } else { args })
            })
            .collect();
        let finish_reason = parse_finish_reason(self.finish_reason.as_deref(), &tool_calls);
        CompletionResponse {
            text: self.text,
            tool_calls,
            usage: self.usage,
            model: self.model,
            finish_reason,
        }
    }
}

/// Consume an SSE response, pushing text deltas into `sink`, and return
/// the aggregated response.
///
/// # Errors
///
/// [`ProviderError::Stream`] on transport or decode failures mid-stream.
/// Chunks already delivered to the sink are not retracted.
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
            if data == "[DONE]" {
                return Ok(state.finish());
            }
            let value: Value = serde_json::from_str(data)
                .map_err(|e| ProviderError::Stream(format!("chunk parse: {e}")))?;
            if let Some(delta_text) = value["choices"][0]["delta"]["content"].as_str()
                && !delta_text.is_empty()
            {
                state.text.push_str(delta_text);
                sink.push(delta_text).await?;
            }
            state.apply(&value);
        }
    }
    // Stream ended without [DONE]; return what was aggregated.
    Ok(state.finish())
}
