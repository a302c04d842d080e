//! One chat turn against a local Ollama with a filesystem tool server.
//!
//! ```bash
//! cargo run --example dispatch -- "list the files in /tmp"
//! ```
//!
//! Requires Ollama on localhost:11434 and `npx` on PATH for the example
//! tool server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tether_context::ConversationState;
use tether_host::{ServerHost, ServerSpec};
use tether_loop::{DispatchLoop, LoopConfig};
use tether_provider_ollama::OllamaProvider;
use tether_types::{Provider, ProviderConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let turn = std::env::args().nth(1).unwrap_or_else(|| "say hello".to_string());

    let provider: Arc<dyn Provider> = Arc::new(OllamaProvider::new(ProviderConfig {
        api_endpoint: "http://localhost:11434".into(),
        default_model: "llama3.2".into(),
        ..ProviderConfig::default()
    })?);

    let mut fs = ServerSpec::new("fs", "npx");
    fs.args = vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()];
    let host = Arc::new(ServerHost::new(vec![fs]));
    for (server, result) in host.start_all().await {
        if let Err(err) = result {
            eprintln!("warning: {server} failed to start: {err}");
        }
    }

    let dispatch = DispatchLoop::new(provider, Arc::clone(&host), LoopConfig::default());
    let mut state = ConversationState::new("You are a terse shell assistant.");
    let outcome = dispatch.run(&mut state, &turn, &CancellationToken::new()).await?;

    println!("{}", outcome.response);
    println!(
        "({} tool calls, {} follow-ups, {} tokens)",
        outcome.tool_calls, outcome.follow_ups, outcome.usage.total_tokens
    );

    host.stop_all().await;
    Ok(())
}
