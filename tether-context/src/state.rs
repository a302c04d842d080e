//! The conversation state handle.

use std::collections::HashMap;

use tether_types::Message;

use crate::trim::{cap_messages, trim, validate_pairing};
use crate::windows::context_window_for;

/// Messages kept when no token model is known.
const DEFAULT_MESSAGE_CAP: usize = 50;
/// Tokens reserved for the completion.
const DEFAULT_RESERVE: usize = 4_096;
/// Tool calls shown in the system-prompt appendix.
const APPENDIX_CALLS: usize = 5;
/// Per-call result truncation in the appendix.
const APPENDIX_RESULT_LEN: usize = 200;

/// One entry in the append-only tool-call history.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    /// Wire name of the tool.
    pub tool: String,
    /// Rendered arguments.
    pub arguments: String,
    /// Result text (or error text).
    pub result: String,
    /// Whether the call failed.
    pub is_error: bool,
}

/// Ordered message log plus the derived view used for transmission.
///
/// Owned by a single driver; mutation goes through `&mut self`, so
/// writes are totally ordered by construction.
#[derive(Debug, Clone)]
pub struct ConversationState {
    system_prompt: String,
    messages: Vec<Message>,
    tool_history: Vec<ToolCallRecord>,
    model: Option<String>,
    window_overrides: HashMap<String, usize>,
    reserve: usize,
    message_cap: usize,
}

impl ConversationState {
    /// Create a state with the given system prompt.
    #[must_use]
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            tool_history: Vec::new(),
            model: None,
            window_overrides: HashMap::new(),
            reserve: DEFAULT_RESERVE,
            message_cap: DEFAULT_MESSAGE_CAP,
        }
    }

    /// Set the model that determines the context window.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Configure per-model window overrides.
    #[must_use]
    pub fn with_window_overrides(mut self, overrides: HashMap<String, usize>) -> Self {
        self.window_overrides = overrides;
        self
    }

    /// Set the completion reserve.
    #[must_use]
    pub fn with_reserve(mut self, reserve: usize) -> Self {
        self.reserve = reserve;
        self
    }

    /// Append a message to the log.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Snapshot of the raw log (without the system message).
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The stored system prompt, without the appendix.
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Record a completed tool call in the append-only history.
    pub fn record_tool_call(&mut self, record: ToolCallRecord) {
        self.tool_history.push(record);
    }

    /// The full tool-call history.
    #[must_use]
    pub fn tool_history(&self) -> &[ToolCallRecord] {
        &self.tool_history
    }

    /// Build the message set to transmit: system message (prompt plus a
    /// bounded recent-tool-call appendix), budget trimming, then pairing
    /// validation, in that order.
    #[must_use]
    pub fn build_for_send(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.push(Message::system(self.system_message()));
        messages.extend(self.messages.iter().cloned());

        let budgeted = match self.budget() {
            Some(budget) => trim(messages, budget),
            None => cap_messages(messages, self.message_cap),
        };
        validate_pairing(budgeted)
    }

    /// The token budget for transmission: window − reserve, when the
    /// model's window is known.
    #[must_use]
    pub fn budget(&self) -> Option<usize> {
        let model = self.model.as_deref()?;
        let window = context_window_for(model, &self.window_overrides)?;
        Some(window.saturating_sub(self.reserve))
    }

    fn system_message(&self) -> String {
        if self.tool_history.is_empty() {
            return self.system_prompt.clone();
        }
        let mut out = self.system_prompt.clone();
        out.push_str("\n\nRecent tool calls:\n");
        let start = self.tool_history.len().saturating_sub(APPENDIX_CALLS);
        for record in &self.tool_history[start..] {
            let mut result = record.result.clone();
            if result.len() > APPENDIX_RESULT_LEN {
                result.truncate(APPENDIX_RESULT_LEN);
                result.push('…');
            }
            let status = if record.is_error { "error" } else { "ok" };
            out.push_str(&format!("- {} ({status}): {}\n", record.tool, result));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{Role, ToolCall};

    fn record(tool: &str, result: &str) -> ToolCallRecord {
        ToolCallRecord {
            tool: tool.into(),
            arguments: "{}".into(),
            result: result.into(),
            is_error: false,
        }
    }

    #[test]
    fn build_for_send_prepends_system() {
        let mut state = ConversationState::new("be terse");
        state.push(Message::user("hi"));
        let sent = state.build_for_send();
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, "be terse");
        assert_eq!(sent[1].content, "hi");
    }

    #[test]
    fn appendix_shows_last_five_calls_truncated() {
        let mut state = ConversationState::new("sys");
        for i in 0..7 {
            state.record_tool_call(record(&format!("tool{i}"), &"r".repeat(300)));
        }
        let sent = state.build_for_send();
        let system = &sent[0].content;
        // Only the last five appear.
        assert!(!system.contains("tool0"));
        assert!(!system.contains("tool1"));
        assert!(system.contains("tool2"));
        assert!(system.contains("tool6"));
        // Results are truncated with a marker.
        assert!(system.contains('…'));
        assert!(!system.contains(&"r".repeat(300)));
    }

    #[test]
    fn unknown_model_falls_back_to_message_cap() {
        let mut state = ConversationState::new("sys").with_model("some-unheard-of-model");
        for i in 0..80 {
            state.push(Message::user(format!("m{i}")));
        }
        assert_eq!(state.budget(), None);
        let sent = state.build_for_send();
        // system + 50 capped messages
        assert_eq!(sent.len(), 51);
        assert_eq!(sent[1].content, "m30");
    }

    #[test]
    fn known_model_budget_is_window_minus_reserve() {
        let state = ConversationState::new("sys").with_model("gpt-4");
        assert_eq!(state.budget(), Some(8_192 - 4_096));
    }

    #[test]
    fn trimming_composes_with_pairing_on_send() {
        // Enough bulk that the assistant declaring A is trimmed out; the
        // paired tool message must not survive alone.
        let mut state = ConversationState::new("sys")
            .with_model("tiny-test-model")
            .with_window_overrides(HashMap::from([("tiny-test-model".to_string(), 300)]))
            .with_reserve(0);
        state.push(Message::assistant_with_calls(
            "x".repeat(1600),
            vec![ToolCall::function("A", "t", "{}")],
        ));
        state.push(Message::tool("A", "result"));
        state.push(Message::user("latest question"));

        let sent = state.build_for_send();
        assert!(sent.iter().all(|m| m.role != Role::Tool));
        assert_eq!(sent.last().unwrap().content, "latest question");
    }

    #[test]
    fn send_view_does_not_mutate_log() {
        let mut state = ConversationState::new("sys");
        state.push(Message::user("hi"));
        let _ = state.build_for_send();
        let _ = state.build_for_send();
        assert_eq!(state.messages().len(), 1);
    }
}
