//! Validated configuration consumed by the orchestrator.
//!
//! Parsing and migration of configuration *files* happen upstream; the
//! structures here are the already-validated result. Secrets appear
//! only as environment-variable names.

use std::collections::HashMap;
use std::path::PathBuf;

use tether_host::ServerSpec;
use tether_loop::LoopConfig;
use tether_serve::ToolExposure;
use tether_types::ProviderConfig;

/// Which wire dialect a provider entry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// OpenAI-compatible chat completions.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Gemini generateContent.
    Gemini,
    /// Local Ollama.
    Ollama,
}

impl ProviderFamily {
    /// Parse a family tag from configuration.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "gemini" => Some(Self::Gemini),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

/// One configured provider entry.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    /// Wire dialect.
    pub family: ProviderFamily,
    /// Endpoint, credentials variable, model, timeouts.
    pub config: ProviderConfig,
}

/// Everything the orchestrator needs to assemble.
#[derive(Debug, Clone)]
pub struct Config {
    /// Named provider entries.
    pub providers: HashMap<String, ProviderEntry>,
    /// The provider used when nothing selects one.
    pub default_provider: String,
    /// Tool servers to supervise.
    pub servers: Vec<ServerSpec>,
    /// Templates exported in serve mode.
    pub exposures: Vec<ToolExposure>,
    /// Dispatch-loop tunables.
    pub loop_config: LoopConfig,
    /// Directory of template YAML files, if any.
    pub templates_dir: Option<PathBuf>,
    /// System prompt for chat conversations.
    pub system_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: String::new(),
            servers: Vec::new(),
            exposures: Vec::new(),
            loop_config: LoopConfig::default(),
            templates_dir: None,
            system_prompt: String::new(),
        }
    }
}
