//! Component assembly.
//!
//! Builds provider instances, the tool-server host, and the template
//! registry from a validated [`Config`], and exposes the three entry
//! points: chat (dispatch loop), template execution, and serve mode.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tether_context::ConversationState;
use tether_host::ServerHost;
use tether_loop::{DispatchLoop, DispatchOutcome, LoopConfig};
use tether_provider_anthropic::AnthropicProvider;
use tether_provider_gemini::GeminiProvider;
use tether_provider_ollama::OllamaProvider;
use tether_provider_openai::OpenAiProvider;
use tether_serve::{ServeOptions, TemplateServer};
use tether_template::{EngineConfig, TemplateEngine, TemplateRegistry};
use tether_types::{ConfigError, LoopError, Provider, TemplateError};

use crate::config::{Config, ProviderFamily};

/// Assembled orchestrator: providers, host, templates.
pub struct Orchestrator {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
    host: Arc<ServerHost>,
    registry: Arc<TemplateRegistry>,
    loop_config: LoopConfig,
    system_prompt: String,
    exposures: Vec<tether_serve::ToolExposure>,
}

impl Orchestrator {
    /// Assemble components from configuration and start the tool
    /// servers. Per-server startup failures are reported and tolerated;
    /// configuration-level failures abort.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for unknown provider families, missing secrets,
    /// unloadable templates, or a missing default provider.
    pub async fn from_config(config: Config) -> Result<Self, ConfigError> {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, entry) in &config.providers {
            let provider = build_provider(entry.family, entry.config.clone())
                .map_err(|e| ConfigError::Invalid(format!("provider {name}: {e}")))?;
            providers.insert(name.clone(), provider);
        }
        if !providers.contains_key(&config.default_provider) {
            return Err(ConfigError::NotFound {
                kind: "provider",
                name: config.default_provider.clone(),
            });
        }

        let mut registry = TemplateRegistry::new();
        if let Some(dir) = &config.templates_dir {
            let loaded = registry
                .load_dir(dir)
                .map_err(|e| ConfigError::Invalid(format!("templates: {e}")))?;
            tracing::info!(loaded, dir = %dir.display(), "templates loaded");
        }
        for exposure in &config.exposures {
            if registry.get(&exposure.template).is_none() {
                return Err(ConfigError::NotFound {
                    kind: "template",
                    name: exposure.template.clone(),
                });
            }
        }

        let host = Arc::new(ServerHost::new(config.servers));
        for (server, result) in host.start_all().await {
            if let Err(err) = result {
                tracing::warn!(server = %server, error = %err, "tool server unavailable");
            }
        }

        Ok(Self {
            providers,
            default_provider: config.default_provider,
            host,
            registry: Arc::new(registry),
            loop_config: config.loop_config,
            system_prompt: config.system_prompt,
            exposures: config.exposures,
        })
    }

    /// The supervised tool-server host.
    #[must_use]
    pub fn host(&self) -> &Arc<ServerHost> {
        &self.host
    }

    /// The loaded template registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Look up a provider by configured name.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] for unknown names.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn Provider>, ConfigError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound { kind: "provider", name: name.to_string() })
    }

    /// A fresh conversation seeded with the configured system prompt.
    #[must_use]
    pub fn new_conversation(&self) -> ConversationState {
        ConversationState::new(self.system_prompt.clone())
    }

    /// Run one chat turn through the dispatch loop with every running
    /// server's tools available.
    ///
    /// # Errors
    ///
    /// Loop failures as [`LoopError`].
    pub async fn chat(
        &self,
        state: &mut ConversationState,
        turn: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, LoopError> {
        let provider = self
            .provider(&self.default_provider)
            .map_err(|e| LoopError::Provider(tether_types::ProviderError::InvalidRequest(e.to_string())))?;
        let dispatch =
            DispatchLoop::new(provider, Arc::clone(&self.host), self.loop_config.clone());
        dispatch.run(state, turn, cancel).await
    }

    /// Build an engine over the named provider (default when `None`).
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] for unknown provider names.
    pub fn engine(&self, provider: Option<&str>) -> Result<TemplateEngine, ConfigError> {
        let name = provider.unwrap_or(&self.default_provider);
        Ok(TemplateEngine::new(
            Arc::clone(&self.registry),
            self.provider(name)?,
            Some(Arc::clone(&self.host)),
            EngineConfig::default(),
        ))
    }

    /// Run a registered template. The template's
    /// `config.defaults.provider` selects the provider entry; the
    /// default provider is used otherwise.
    ///
    /// # Errors
    ///
    /// [`TemplateError`] from execution; unknown templates and
    /// providers surface as [`TemplateError::NotFound`] /
    /// [`TemplateError::Parse`].
    pub async fn run_template(
        &self,
        name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        let template = self
            .registry
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
        let provider_name = template.config.defaults.provider.as_deref();
        let engine = self
            .engine(provider_name)
            .map_err(|e| TemplateError::Parse(e.to_string()))?;
        engine.run(name, input, cancel).await
    }

    /// Build the exposed-as-server surface with one engine per
    /// configured provider, so exposures can override providers.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when engine assembly fails.
    pub fn template_server(&self, options: ServeOptions) -> Result<Arc<TemplateServer>, ConfigError> {
        let default_engine = Arc::new(self.engine(None)?);
        let mut server =
            TemplateServer::new(default_engine, self.exposures.clone(), options);
        for name in self.providers.keys() {
            server = server.with_engine(name.clone(), Arc::new(self.engine(Some(name))?));
        }
        Ok(Arc::new(server))
    }

    /// Gracefully stop every tool server.
    pub async fn shutdown(&self) {
        self.host.stop_all().await;
        for provider in self.providers.values() {
            if let Err(err) = provider.close().await {
                tracing::warn!(error = %err, "provider close failed");
            }
        }
    }
}

fn build_provider(
    family: ProviderFamily,
    config: tether_types::ProviderConfig,
) -> Result<Arc<dyn Provider>, tether_types::ProviderError> {
    Ok(match family {
        ProviderFamily::OpenAi => Arc::new(OpenAiProvider::new(config)?),
        ProviderFamily::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        ProviderFamily::Gemini => Arc::new(GeminiProvider::new(config)?),
        ProviderFamily::Ollama => Arc::new(OllamaProvider::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;
    use tether_types::ProviderConfig;

    fn ollama_entry() -> ProviderEntry {
        ProviderEntry {
            family: ProviderFamily::Ollama,
            config: ProviderConfig {
                api_endpoint: "http://localhost:11434".into(),
                default_model: "llama3.2".into(),
                ..ProviderConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn missing_default_provider_is_config_error() {
        let config = Config {
            providers: HashMap::from([("local".to_string(), ollama_entry())]),
            default_provider: "cloud".into(),
            ..Config::default()
        };
        let err = Orchestrator::from_config(config).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { kind: "provider", .. }));
    }

    #[tokio::test]
    async fn exposure_must_reference_loaded_template() {
        let config = Config {
            providers: HashMap::from([("local".to_string(), ollama_entry())]),
            default_provider: "local".into(),
            exposures: vec![tether_serve::ToolExposure {
                name: "t".into(),
                description: String::new(),
                template: "ghost".into(),
                arguments: vec![],
                provider: None,
            }],
            ..Config::default()
        };
        let err = Orchestrator::from_config(config).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { kind: "template", .. }));
    }

    #[tokio::test]
    async fn templates_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("summarize.yaml"),
            "name: summarize\nsteps:\n  - name: run\n    prompt: 'Summarize {{input_data}}'\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a template").unwrap();

        let config = Config {
            providers: HashMap::from([("local".to_string(), ollama_entry())]),
            default_provider: "local".into(),
            templates_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let orchestrator = Orchestrator::from_config(config).await.unwrap();
        assert_eq!(orchestrator.registry().names(), vec!["summarize"]);
    }

    #[tokio::test]
    async fn broken_template_fails_assembly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "name: bad\nsteps:\n  - name: s\n").unwrap();

        let config = Config {
            providers: HashMap::from([("local".to_string(), ollama_entry())]),
            default_provider: "local".into(),
            templates_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        assert!(Orchestrator::from_config(config).await.is_err());
    }

    #[tokio::test]
    async fn assembles_with_no_servers_or_templates() {
        let config = Config {
            providers: HashMap::from([("local".to_string(), ollama_entry())]),
            default_provider: "local".into(),
            ..Config::default()
        };
        let orchestrator = Orchestrator::from_config(config).await.unwrap();
        assert!(orchestrator.registry().is_empty());
        assert!(orchestrator.host().server_names().is_empty());
        assert!(orchestrator.provider("local").is_ok());
        assert!(orchestrator.provider("other").is_err());
    }
}
