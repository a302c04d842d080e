//! Configuration for the dispatch loop.

use std::time::Duration;

/// Tunables for [`DispatchLoop`](crate::DispatchLoop).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum provider completions after the initial one.
    pub max_follow_ups: usize,
    /// Deadline handed to each tool call.
    pub tool_deadline: Duration,
    /// Sampling temperature for provider calls.
    pub temperature: Option<f32>,
    /// Output token limit for provider calls.
    pub max_tokens: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_follow_ups: 2,
            tool_deadline: Duration::from_secs(30),
            temperature: None,
            max_tokens: None,
        }
    }
}
