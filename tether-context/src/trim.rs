//! Trimming and pairing as two pure functions.
//!
//! [`trim`] enforces the token budget; [`validate_pairing`] enforces the
//! tool-call/result invariant. They compose as `validate_pairing(trim(m,
//! b))`: trimming first, so validation sees the final transmitted set.

use tether_types::{Message, Role};

/// Chars-per-token ratio of the fallback estimator.
const CHARS_PER_TOKEN: usize = 4;
/// Fixed overhead per message (role, framing).
const MESSAGE_OVERHEAD: usize = 4;

/// Deterministic, monotone token estimate for one message.
#[must_use]
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = message.content.len();
    for call in &message.tool_calls {
        chars += call.function.name.len() + call.function.arguments.len();
    }
    chars / CHARS_PER_TOKEN + MESSAGE_OVERHEAD
}

/// Token estimate for a message set.
#[must_use]
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Drop the oldest non-system messages until the estimate fits `budget`.
///
/// System messages are never dropped. The relative order of survivors is
/// unchanged.
#[must_use]
pub fn trim(messages: Vec<Message>, budget: usize) -> Vec<Message> {
    let mut total = estimate_tokens(&messages);
    if total <= budget {
        return messages;
    }

    let mut keep = vec![true; messages.len()];
    for (i, message) in messages.iter().enumerate() {
        if total <= budget {
            break;
        }
        if message.role == Role::System {
            continue;
        }
        keep[i] = false;
        total -= estimate_message_tokens(message);
    }
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped > 0 {
        tracing::debug!(dropped, remaining_estimate = total, "trimmed conversation");
    }

    messages
        .into_iter()
        .zip(keep)
        .filter_map(|(message, keep)| keep.then_some(message))
        .collect()
}

/// Keep the newest `cap` non-system messages. Fallback when no token
/// model is known.
#[must_use]
pub fn cap_messages(messages: Vec<Message>, cap: usize) -> Vec<Message> {
    let non_system = messages.iter().filter(|m| m.role != Role::System).count();
    if non_system <= cap {
        return messages;
    }
    let mut to_drop = non_system - cap;
    messages
        .into_iter()
        .filter(|message| {
            if message.role != Role::System && to_drop > 0 {
                to_drop -= 1;
                false
            } else {
                true
            }
        })
        .collect()
}

/// Drop every `tool` message whose `tool_call_id` is not declared by an
/// *earlier* assistant message in the same set.
#[must_use]
pub fn validate_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut declared: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::Assistant => {
                for call in &message.tool_calls {
                    declared.insert(call.id.clone());
                }
                kept.push(message);
            }
            Role::Tool => {
                let paired = message
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| declared.contains(id));
                if paired {
                    kept.push(message);
                } else {
                    tracing::debug!(
                        tool_call_id = message.tool_call_id.as_deref().unwrap_or(""),
                        "dropping orphaned tool message"
                    );
                }
            }
            _ => kept.push(message),
        }
    }
    kept
}
