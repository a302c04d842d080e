#![deny(missing_docs)]
//! OpenAI-compatible provider for tether.
//!
//! Speaks the chat-completions dialect, which is also what many
//! compatible gateways and local servers expose. Tool calls ride in the
//! `tool_calls` side array; streaming arrives as SSE delta chunks.

mod mapping;
mod streaming;

use async_trait::async_trait;

use tether_types::{
    CompletionRequest, CompletionResponse, Provider, ProviderConfig, ProviderError, RetryPolicy,
    StreamSink, retry_with_policy,
};

/// Provider for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiProvider {
    config: ProviderConfig,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    /// Build a provider from validated configuration. The API key is
    /// read from the environment here and never logged.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Authentication`] when the configured key
    /// variable is unset.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.read_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Other(Box::new(e)))?;
        let retry = RetryPolicy { max_attempts: config.max_retries.max(1), ..RetryPolicy::default() };
        Ok(Self { config, api_key, client, retry })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_endpoint.trim_end_matches('/'))
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.config.timeout)
            } else {
                ProviderError::Network(Box::new(e))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(ProviderError::RateLimit { retry_after });
        }
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
        let body = mapping::to_api_request(request, &self.config.default_model);
        let response = self.post(&body).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        mapping::from_api_response(&value)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        retry_with_policy(self.retry, || self.complete_once(&request)).await
    }

    async fn stream(
        &self,
        mut request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError> {
        request.stream = true;
        let body = mapping::to_api_request(&request, &self.config.default_model);
        // No retry once the stream is open: delivered chunks stand.
        let response = self.post(&body).await?;
        streaming::run_stream(response, sink).await
    }

    fn provider_type(&self) -> &str {
        "openai"
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
