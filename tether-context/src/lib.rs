#![deny(missing_docs)]
//! Conversation state for the tether loop.
//!
//! An append-only message log plus a derived, transmission-ready view:
//! system prompt (with a short recent-tool-call appendix), token-budget
//! trimming, then tool-call pairing validation, in exactly that order,
//! so only the messages actually transmitted are validated.

pub mod state;
pub mod trim;
pub mod windows;

pub use state::{ConversationState, ToolCallRecord};
pub use trim::{cap_messages, estimate_message_tokens, estimate_tokens, trim, validate_pairing};
pub use windows::context_window_for;
