//! Scripted provider for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::{Provider, StreamSink};
use crate::types::{CompletionRequest, CompletionResponse};

/// A [`Provider`] that replays a fixed script of responses and records
/// every request it receives.
///
/// Running out of script is a test bug and fails the call loudly.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Create a provider that answers with `responses` in order.
    #[must_use]
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a provider from explicit results, allowing scripted errors.
    #[must_use]
    pub fn from_results(results: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
        Self { script: Mutex::new(results.into_iter().collect()), requests: Mutex::new(Vec::new()) }
    }

    /// Requests observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    /// Number of scripted responses not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock poisoned").len()
    }

    fn next(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().expect("requests lock poisoned").push(request);
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::InvalidRequest("scripted provider exhausted".into()))
            })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.next(request)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.next(request)?;
        // Deliver the text in two chunks to exercise ordering.
        let text = response.text.clone();
        let mid = text.len() / 2;
        let (head, tail) = text.split_at(mid);
        if !head.is_empty() {
            sink.push(head).await?;
        }
        if !tail.is_empty() {
            sink.push(tail).await?;
        }
        Ok(response)
    }

    fn provider_type(&self) -> &str {
        "scripted"
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
