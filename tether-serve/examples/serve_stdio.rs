//! Expose a template as a tool server over stdio.
//!
//! Point an orchestrator at this binary as a tool-server command; it
//! advertises one `summarize` tool backed by a single-prompt template.

use std::sync::Arc;

use tether_provider_ollama::OllamaProvider;
use tether_serve::{ServeOptions, TemplateServer, ToolExposure};
use tether_template::{EngineConfig, Template, TemplateEngine, TemplateRegistry};
use tether_types::{Provider, ProviderConfig};

const SUMMARIZE: &str = "
name: summarize
description: Summarize the input in three sentences
steps:
  - name: summary
    prompt: 'Summarize the following in three sentences: {{input_data}}'
";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = TemplateRegistry::new();
    registry.insert(Template::from_yaml_str(SUMMARIZE)?);

    let provider: Arc<dyn Provider> = Arc::new(OllamaProvider::new(ProviderConfig {
        api_endpoint: "http://localhost:11434".into(),
        default_model: "llama3.2".into(),
        ..ProviderConfig::default()
    })?);
    let engine = Arc::new(TemplateEngine::new(
        Arc::new(registry),
        provider,
        None,
        EngineConfig::default(),
    ));

    let server = Arc::new(TemplateServer::new(
        engine,
        vec![ToolExposure {
            name: "summarize".into(),
            description: "Summarize text in three sentences".into(),
            template: "summarize".into(),
            arguments: vec![],
            provider: None,
        }],
        ServeOptions::default(),
    ));

    server.serve_stdio().await?;
    Ok(())
}
