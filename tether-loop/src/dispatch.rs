//! Loop implementation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_context::{ConversationState, ToolCallRecord};
use tether_host::ServerHost;
use tether_types::{
    CompletionRequest, LoopError, Message, Provider, StreamSink, ToolCall, ToolDefinition, Usage,
};

use crate::config::LoopConfig;

/// Note appended to the assistant text when the follow-up cap stops the
/// loop with tool calls still pending.
const DEPTH_CAP_NOTE: &str = "\n\n[Tool follow-up limit reached; stopping here.]";

/// Phrases that signal the model *intends* to use a tool without having
/// issued a call. Lowercase; matched against the lowercased response.
const TOOL_INTENT_PHRASES: &[&str] = &[
    "i'll use the",
    "i will use the",
    "let me use the",
    "i'll call the",
    "i will call the",
    "let me call the",
    "i'll run the",
    "let me run the",
];

/// The result of one dispatched turn.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Final assistant text.
    pub response: String,
    /// Cumulative token usage across all completions.
    pub usage: Usage,
    /// Follow-up completions performed (0 when the first answer was final).
    pub follow_ups: usize,
    /// Tool calls executed.
    pub tool_calls: usize,
}

/// Drives one conversation turn through provider completions and tool
/// execution.
pub struct DispatchLoop {
    provider: Arc<dyn Provider>,
    host: Arc<ServerHost>,
    config: LoopConfig,
}

impl DispatchLoop {
    /// Create a loop over the given provider and host.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, host: Arc<ServerHost>, config: LoopConfig) -> Self {
        Self { provider, host, config }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run one user turn to completion.
    ///
    /// Appends the user message, then alternates provider completions
    /// and tool execution until the model answers without tool calls or
    /// the follow-up cap is reached. Per-tool failures become `tool`
    /// messages and never abort the turn.
    ///
    /// # Errors
    ///
    /// [`LoopError::Provider`] when a completion fails,
    /// [`LoopError::Host`] when the catalog cannot be assembled, and
    /// [`LoopError::Cancelled`] on cancellation.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        user_turn: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, LoopError> {
        self.run_inner(state, user_turn, None, cancel).await
    }

    /// Like [`run`](Self::run), but every completion streams its text
    /// into `sink` as it is generated. Chunks from intermediate
    /// (tool-calling) completions are delivered too, in order.
    ///
    /// # Errors
    ///
    /// Same failures as [`run`](Self::run); a mid-stream provider
    /// failure does not retract chunks already pushed.
    pub async fn run_streaming(
        &self,
        state: &mut ConversationState,
        user_turn: &str,
        sink: &mut dyn StreamSink,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, LoopError> {
        self.run_inner(state, user_turn, Some(sink), cancel).await
    }

    async fn run_inner(
        &self,
        state: &mut ConversationState,
        user_turn: &str,
        mut sink: Option<&mut dyn StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, LoopError> {
        state.push(Message::user(user_turn));

        let tools = self.host.tools()?;
        let mut usage = Usage::default();
        let mut follow_ups = 0usize;
        let mut executed_calls = 0usize;
        let mut tools_disabled = false;

        loop {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }

            let request = self.build_request(state, &tools, tools_disabled);
            let response = match sink.as_deref_mut() {
                Some(sink) => self.provider.stream(request, sink).await?,
                None => self.provider.complete(request).await?,
            };
            usage.add(&response.usage);

            state.push(Message::assistant_with_calls(
                response.text.clone(),
                response.tool_calls.clone(),
            ));

            if response.tool_calls.is_empty() {
                // A model that announces a tool it never called gets one
                // last completion with tools withheld.
                if !tools_disabled
                    && !tools.is_empty()
                    && claims_tool_use(&response.text)
                {
                    tracing::debug!("response claims tool use without a call; forcing final answer");
                    tools_disabled = true;
                    continue;
                }
                return Ok(DispatchOutcome {
                    response: response.text,
                    usage,
                    follow_ups,
                    tool_calls: executed_calls,
                });
            }

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return Err(LoopError::Cancelled);
                }
                self.execute_call(state, call).await;
                executed_calls += 1;
            }

            if follow_ups >= self.config.max_follow_ups {
                tracing::debug!(cap = self.config.max_follow_ups, "follow-up cap reached");
                return Ok(DispatchOutcome {
                    response: format!("{}{DEPTH_CAP_NOTE}", response.text),
                    usage,
                    follow_ups,
                    tool_calls: executed_calls,
                });
            }
            follow_ups += 1;
        }
    }

    fn build_request(
        &self,
        state: &ConversationState,
        tools: &[ToolDefinition],
        tools_disabled: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            messages: state.build_for_send(),
            tools: if tools_disabled { vec![] } else { tools.to_vec() },
            system_prompt: String::new(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        }
    }

    /// Execute one call and append its `tool` message. Every call id
    /// gets a message, failures included.
    async fn execute_call(&self, state: &mut ConversationState, call: &ToolCall) {
        let wire = call.function.name.as_str();
        let outcome = match call.parsed_arguments() {
            Err(reason) => Err(reason),
            Ok(args) => {
                match self
                    .host
                    .call(wire, serde_json::Value::Object(args), self.config.tool_deadline)
                    .await
                {
                    Ok(result) if result.is_error => {
                        Err(result.error.clone().unwrap_or_else(|| result.text()))
                    }
                    Ok(result) => Ok(result.text()),
                    Err(err) => Err(err.to_string()),
                }
            }
        };

        let (text, is_error) = match outcome {
            Ok(text) => (text, false),
            Err(reason) => {
                tracing::warn!(tool = wire, %reason, "tool call failed");
                (format!("Error: {reason}"), true)
            }
        };

        state.push(Message::tool(call.id.clone(), text.clone()));
        state.record_tool_call(ToolCallRecord {
            tool: wire.to_string(),
            arguments: call.function.arguments.clone(),
            result: text,
            is_error,
        });
    }
}

/// Whether free text announces a tool use.
fn claims_tool_use(text: &str) -> bool {
    let lower = text.to_lowercase();
    TOOL_INTENT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_phrases_match_case_insensitively() {
        assert!(claims_tool_use("I'll use the search tool to find that."));
        assert!(claims_tool_use("Let me call the fs_list tool."));
        assert!(!claims_tool_use("The tool returned nothing."));
        assert!(!claims_tool_use("Here is your answer."));
    }
}
