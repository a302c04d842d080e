#![deny(missing_docs)]
//! Ollama provider for tether.
//!
//! Talks to a local Ollama instance over `/api/chat`. Native tool
//! calling is used when the model supports it; otherwise free-text
//! `<tool_call>` markers are detected and promoted to tool calls.

mod mapping;
mod streaming;

use async_trait::async_trait;

use tether_types::{
    CompletionRequest, CompletionResponse, Provider, ProviderConfig, ProviderError, RetryPolicy,
    StreamSink, retry_with_policy,
};

pub use mapping::detect_inline_tool_calls;

/// Provider for a local Ollama endpoint.
pub struct OllamaProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OllamaProvider {
    /// Build a provider from validated configuration. Ollama runs
    /// unauthenticated, so no secret is read.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Other`] when the HTTP client cannot be built.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Other(Box::new(e)))?;
        let retry = RetryPolicy { max_attempts: config.max_retries.max(1), ..RetryPolicy::default() };
        Ok(Self { config, client, retry })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.config.api_endpoint.trim_end_matches('/'))
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let response = self.client.post(self.endpoint()).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout)
            } else {
                ProviderError::Network(Box::new(e))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    async fn complete_once(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = mapping::to_api_request(request, &self.config.default_model, false);
        let response = self.post(&body).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        mapping::from_api_response(&value)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        retry_with_policy(self.retry, || self.complete_once(&request)).await
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = mapping::to_api_request(&request, &self.config.default_model, true);
        let response = self.post(&body).await?;
        streaming::run_stream(response, sink).await
    }

    fn provider_type(&self) -> &str {
        "ollama"
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        if self.config.api_endpoint.is_empty() {
            return Err(ProviderError::InvalidRequest("api_endpoint is empty".into()));
        }
        if self.config.default_model.is_empty() {
            return Err(ProviderError::InvalidRequest("default_model is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            api_endpoint: "http://localhost:11434".into(),
            default_model: "llama3.2".into(),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn endpoint_is_api_chat() {
        let provider = OllamaProvider::new(config()).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn no_key_required() {
        let provider = OllamaProvider::new(config()).unwrap();
        assert!(provider.validate_config().is_ok());
    }
}
