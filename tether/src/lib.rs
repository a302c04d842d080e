#![deny(missing_docs)]
//! # tether: umbrella crate
//!
//! Single import surface for the tether orchestrator, plus the glue
//! that assembles providers, tool servers, and templates from a
//! validated configuration.

pub use tether_context;
pub use tether_host;
pub use tether_loop;
pub use tether_provider_anthropic;
pub use tether_provider_gemini;
pub use tether_provider_ollama;
pub use tether_provider_openai;
pub use tether_rpc;
pub use tether_serve;
pub use tether_template;
pub use tether_types;

pub mod config;
pub mod orchestrator;

pub use config::{Config, ProviderEntry, ProviderFamily};
pub use orchestrator::Orchestrator;

/// Happy-path imports for embedding tether.
pub mod prelude {
    pub use tether_context::ConversationState;
    pub use tether_host::{ServerHost, ServerSpec};
    pub use tether_loop::{DispatchLoop, DispatchOutcome, LoopConfig};
    pub use tether_serve::{ServeOptions, TemplateServer, ToolExposure};
    pub use tether_template::{Template, TemplateEngine, TemplateRegistry};
    pub use tether_types::{
        CompletionRequest, CompletionResponse, Message, Provider, ProviderConfig, ProviderError,
        Role, StreamSink, ToolCall, ToolDefinition, ToolResult,
    };

    pub use crate::config::{Config, ProviderEntry, ProviderFamily};
    pub use crate::orchestrator::Orchestrator;
}
