//! Run a YAML template from disk against a local Ollama.
//!
//! ```bash
//! cargo run --example run_template -- path/to/template.yaml "input text"
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_provider_ollama::OllamaProvider;
use tether_template::{EngineConfig, Template, TemplateEngine, TemplateRegistry};
use tether_types::{Provider, ProviderConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: run_template <file.yaml> [input]")?;
    let input = args.next().unwrap_or_default();

    let template = Template::from_yaml_file(std::path::Path::new(&path))?;
    let name = template.name.clone();
    let mut registry = TemplateRegistry::new();
    registry.insert(template);

    let provider: Arc<dyn Provider> = Arc::new(OllamaProvider::new(ProviderConfig {
        api_endpoint: "http://localhost:11434".into(),
        default_model: "llama3.2".into(),
        ..ProviderConfig::default()
    })?);

    let engine =
        TemplateEngine::new(Arc::new(registry), provider, None, EngineConfig::default());
    let output = engine
        .run(&name, serde_json::Value::String(input), &CancellationToken::new())
        .await?;

    println!("{output}");
    Ok(())
}
