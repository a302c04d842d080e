//! Per-model context window sizes.
//!
//! Longest-prefix lookup over a built-in table; configuration overrides
//! (exact model names) win over the table.

use std::collections::HashMap;

/// Built-in context windows, matched by model-name prefix.
const BUILTIN_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("claude-3-5", 200_000),
    ("claude-3", 200_000),
    ("claude-", 200_000),
    ("gemini-1.5-pro", 2_000_000),
    ("gemini-1.5", 1_000_000),
    ("gemini-2", 1_000_000),
    ("llama3", 8_192),
    ("llama2", 4_096),
    ("mistral", 32_768),
    ("qwen", 32_768),
];

/// Context window for `model`, or `None` for an unknown model.
///
/// `overrides` are exact-name matches from configuration and take
/// precedence over the built-in table.
#[must_use]
pub fn context_window_for(model: &str, overrides: &HashMap<String, usize>) -> Option<usize> {
    if let Some(window) = overrides.get(model) {
        return Some(*window);
    }
    BUILTIN_WINDOWS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, window)| *window)
}
