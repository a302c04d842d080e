//! The provider contract.
//!
//! Every LLM backend implements [`Provider`]. The trait is object-safe so
//! providers can be shared as `Arc<dyn Provider>`: they are immutable
//! after construction and hold no per-conversation state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{CompletionRequest, CompletionResponse};

/// Receives ordered text chunks during a streaming completion.
///
/// `push` is async so a slow consumer naturally backpressures the
/// decoder: the provider does not read the next network chunk until the
/// sink has accepted the current one.
#[async_trait]
pub trait StreamSink: Send {
    /// Accept one text chunk.
    async fn push(&mut self, chunk: &str) -> Result<(), ProviderError>;
}

/// A sink that accumulates chunks into a string. Useful in tests and for
/// callers that want streaming side effects plus the full text.
#[derive(Debug, Default)]
pub struct CollectSink {
    /// Everything pushed so far, in order.
    pub collected: String,
}

#[async_trait]
impl StreamSink for CollectSink {
    async fn push(&mut self, chunk: &str) -> Result<(), ProviderError> {
        self.collected.push_str(chunk);
        Ok(())
    }
}

/// LLM provider interface.
///
/// Implementations map [`CompletionRequest`] onto their wire format and
/// back. Tool parameter schemas are forwarded verbatim; a provider MUST
/// NOT rewrite them.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a completion request and await the full response.
    async fn complete(&self, request: CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    /// Stream a completion, pushing text chunks into `sink` as they
    /// arrive, and return the aggregated response.
    ///
    /// A mid-stream failure surfaces as an error from this method;
    /// chunks already pushed are not retracted.
    async fn stream(
        &self,
        request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Stable identifier for this provider family ("openai",
    /// "anthropic", "gemini", "ollama").
    fn provider_type(&self) -> &str;

    /// Pre-flight check of credentials and endpoint shape.
    fn validate_config(&self) -> Result<(), ProviderError>;

    /// Release any held resources. Providers are stateless, so the
    /// default is a no-op.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Already-validated provider configuration, as consumed by the provider
/// crates. Secrets arrive as environment variable *names*; the value is
/// read at construction and never logged.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base endpoint, e.g. `https://api.openai.com/v1`.
    pub api_endpoint: String,
    /// Name of the environment variable holding the API key. `None` for
    /// unauthenticated local endpoints.
    pub api_key_env: Option<String>,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry attempts for retryable failures.
    pub max_retries: u32,
    /// Per-model context window overrides.
    pub context_windows: HashMap<String, usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            api_key_env: None,
            default_model: String::new(),
            timeout: Duration::from_secs(120),
            max_retries: 3,
            context_windows: HashMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Read the configured secret from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Authentication`] naming the variable (not
    /// its value) when it is required but unset.
    pub fn read_api_key(&self) -> Result<Option<String>, ProviderError> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(value) if !value.is_empty() => Ok(Some(value)),
                _ => Err(ProviderError::Authentication(format!(
                    "environment variable {var} is not set"
                ))),
            },
        }
    }
}
