#![deny(missing_docs)]
//! Core types shared across the tether workspace.
//!
//! This crate defines the conversation model (messages, tool calls, tool
//! results), the provider contract ([`Provider`], [`StreamSink`]), the
//! error taxonomy for every tether crate, and the retry policy wrapper.
//! It deliberately has no I/O of its own; transports, HTTP clients, and
//! process handling live in the crates that need them.

pub mod error;
pub mod provider;
pub mod retry;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
pub mod types;

pub use error::{
    ConfigError, HostError, LoopError, ProviderError, RpcError, ServeError, TemplateError,
};
pub use provider::{Provider, ProviderConfig, StreamSink};
pub use retry::{Backoff, RetryPolicy, retry_with_policy};
pub use types::{
    CompletionRequest, CompletionResponse, FinishReason, FunctionCall, Message, Role, ToolCall,
    ToolContent, ToolDefinition, ToolResult, Usage,
};
