//! Template engine integration tests over stub providers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tether_template::{EngineConfig, Template, TemplateEngine, TemplateRegistry};
use tether_types::test_util::ScriptedProvider;
use tether_types::{
    CompletionRequest, CompletionResponse, Provider, ProviderError, StreamSink, TemplateError,
};

/// Replies with the rendered prompt itself: what the engine sent is
/// exactly what comes back, which makes variable tests self-checking.
struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(CompletionResponse::text_only(prompt, "echo"))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(request).await?;
        sink.push(&response.text).await?;
        Ok(response)
    }

    fn provider_type(&self) -> &str {
        "echo"
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Maps prompt substrings to replies, with optional per-reply delays so
/// completion order can differ from declaration order.
struct KeyedProvider {
    replies: HashMap<&'static str, (&'static str, Duration)>,
}

impl KeyedProvider {
    fn new(entries: &[(&'static str, &'static str, u64)]) -> Self {
        let replies = entries
            .iter()
            .map(|(key, reply, delay_ms)| (*key, (*reply, Duration::from_millis(*delay_ms))))
            .collect();
        Self { replies }
    }
}

#[async_trait]
impl Provider for KeyedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        for (key, (reply, delay)) in &self.replies {
            if prompt.contains(key) {
                tokio::time::sleep(*delay).await;
                return Ok(CompletionResponse::text_only(*reply, "keyed"));
            }
        }
        Err(ProviderError::InvalidRequest(format!("no reply for prompt: {prompt}")))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: &mut dyn StreamSink,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(request).await?;
        sink.push(&response.text).await?;
        Ok(response)
    }

    fn provider_type(&self) -> &str {
        "keyed"
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn engine_with(provider: Arc<dyn Provider>, templates: &[&str]) -> TemplateEngine {
    let mut registry = TemplateRegistry::new();
    for yaml in templates {
        registry.insert(Template::from_yaml_str(yaml).unwrap());
    }
    TemplateEngine::new(Arc::new(registry), provider, None, EngineConfig::default())
}

async fn run(engine: &TemplateEngine, name: &str, input: Value) -> Result<Value, TemplateError> {
    engine.run(name, input, &CancellationToken::new()).await
}

/// For-each binds item, index, first, last, total.
#[tokio::test]
async fn for_each_loop_variables() {
    let engine = engine_with(
        Arc::new(EchoProvider),
        &["
name: per_file
steps:
  - name: describe
    for_each: '{{input_data.files}}'
    item_name: f
    prompt: '{{index}}:{{f}} first={{first}} last={{last}} total={{total}}'
"],
    );
    let output = run(&engine, "per_file", json!({"files": ["a", "b", "c"]})).await.unwrap();
    assert_eq!(
        output,
        json!([
            "0:a first=true last=false total=3",
            "1:b first=false last=false total=3",
            "2:c first=false last=true total=3",
        ])
    );
}

/// For-each over an empty array runs zero iterations and yields [].
#[tokio::test]
async fn for_each_empty_array() {
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let engine = engine_with(provider.clone(), &["
name: none
steps:
  - name: loop
    for_each: '{{input_data.files}}'
    prompt: 'never rendered {{item}}'
"]);
    let output = run(&engine, "none", json!({"files": []})).await.unwrap();
    assert_eq!(output, json!([]));
    assert!(provider.requests().is_empty());
}

/// A parallel group with aggregate array preserves declared order
/// even when completion order differs, under a concurrency bound.
#[tokio::test]
async fn parallel_array_aggregate_keeps_declared_order() {
    let provider = Arc::new(KeyedProvider::new(&[
        ("first prompt", "a", 40),
        ("second prompt", "b", 10),
        ("third prompt", "c", 0),
    ]));
    let engine = engine_with(provider, &["
name: fan
steps:
  - name: group
    parallel:
      max_concurrent: 2
      aggregate: array
      steps:
        - name: p1
          prompt: 'first prompt'
        - name: p2
          prompt: 'second prompt'
        - name: p3
          prompt: 'third prompt'
"]);
    let output = run(&engine, "fan", Value::Null).await.unwrap();
    assert_eq!(output, json!(["a", "b", "c"]));
}

/// Merge aggregation labels each child's text with its name.
#[tokio::test]
async fn parallel_merge_aggregate_has_headers() {
    let provider = Arc::new(KeyedProvider::new(&[
        ("first prompt", "alpha", 0),
        ("second prompt", "beta", 0),
    ]));
    let engine = engine_with(provider, &["
name: fan
steps:
  - name: group
    parallel:
      aggregate: merge
      steps:
        - name: p1
          prompt: 'first prompt'
        - name: p2
          prompt: 'second prompt'
"]);
    let output = run(&engine, "fan", Value::Null).await.unwrap();
    let text = output.as_str().unwrap();
    assert!(text.contains("### p1\nalpha"));
    assert!(text.contains("### p2\nbeta"));
}

/// A failing parallel child under `stop` fails the group; under
/// `continue` the group completes with the child's slot defaulted.
#[tokio::test]
async fn parallel_failing_child_policies() {
    let failing_stop = "
name: fan
steps:
  - name: group
    parallel:
      aggregate: array
      steps:
        - name: ok
          prompt: 'first prompt'
        - name: bad
          prompt: 'unmatched prompt'
";
    let provider = Arc::new(KeyedProvider::new(&[("first prompt", "a", 0)]));
    let engine = engine_with(provider, &[failing_stop]);
    let err = run(&engine, "fan", Value::Null).await.unwrap_err();
    assert!(matches!(err, TemplateError::StepFailed { .. }));

    let failing_continue = "
name: fan
steps:
  - name: group
    parallel:
      aggregate: array
      steps:
        - name: ok
          prompt: 'first prompt'
        - name: bad
          prompt: 'unmatched prompt'
          on_failure: continue
          default_output: 'fallback'
";
    let provider = Arc::new(KeyedProvider::new(&[("first prompt", "a", 0)]));
    let engine = engine_with(provider, &[failing_continue]);
    let output = run(&engine, "fan", Value::Null).await.unwrap();
    assert_eq!(output, json!(["a", "fallback"]));
}

/// Parallel children see the pre-group scope; their outputs appear in
/// the parent scope only after the group completes.
#[tokio::test]
async fn parallel_children_bind_after_join() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: fan
steps:
  - name: seed
    prompt: 'seeded'
  - name: group
    parallel:
      aggregate: array
      steps:
        - name: p1
          prompt: 'child sees {{seed}}'
  - name: after
    prompt: 'after sees {{p1}}'
"]);
    let output = run(&engine, "fan", Value::Null).await.unwrap();
    assert_eq!(output, json!("after sees child sees seeded"));
}

/// Conditions skip steps; the template's output is the last *executed*
/// step's output.
#[tokio::test]
async fn condition_skips_and_termination_ignores_skipped() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: cond
config:
  defaults:
    variables:
      plan: pro
steps:
  - name: always
    prompt: 'ran'
  - name: never
    prompt: 'should not run'
    condition: '{{plan}} == free'
"]);
    let output = run(&engine, "cond", Value::Null).await.unwrap();
    assert_eq!(output, json!("ran"));
}

/// on_failure: continue binds default_output and later steps can use it.
#[tokio::test]
async fn continue_policy_uses_default_output() {
    let provider = Arc::new(ScriptedProvider::from_results(vec![
        Err(ProviderError::InvalidRequest("boom".into())),
        Ok(CompletionResponse::text_only("used fallback", "scripted")),
    ]));
    let engine = engine_with(provider.clone(), &["
name: t
steps:
  - name: flaky
    prompt: 'try'
    on_failure: continue
    default_output: 'fallback'
  - name: next
    prompt: 'got {{flaky}}'
"]);
    let output = run(&engine, "t", Value::Null).await.unwrap();
    assert_eq!(output, json!("used fallback"));
    let second_prompt = provider.requests()[1].messages.last().unwrap().content.clone();
    assert_eq!(second_prompt, "got fallback");
}

/// on_failure: retry retries with backoff until success.
#[tokio::test]
async fn retry_policy_retries_until_success() {
    let provider = Arc::new(ScriptedProvider::from_results(vec![
        Err(ProviderError::ServiceUnavailable("503".into())),
        Err(ProviderError::ServiceUnavailable("503".into())),
        Ok(CompletionResponse::text_only("third time", "scripted")),
    ]));
    let engine = engine_with(provider.clone(), &["
name: t
steps:
  - name: flaky
    prompt: 'try'
    on_failure: retry
    max_retries: 2
    initial_delay: 0
"]);
    let output = run(&engine, "t", Value::Null).await.unwrap();
    assert_eq!(output, json!("third time"));
    assert_eq!(provider.requests().len(), 3);
}

/// Retry exhaustion without default_output fails the step.
#[tokio::test]
async fn retry_exhaustion_fails() {
    let provider = Arc::new(ScriptedProvider::from_results(vec![
        Err(ProviderError::ServiceUnavailable("503".into())),
        Err(ProviderError::ServiceUnavailable("503".into())),
    ]));
    let engine = engine_with(provider, &["
name: t
steps:
  - name: flaky
    prompt: 'try'
    on_failure: retry
    max_retries: 1
    initial_delay: 0
"]);
    let err = run(&engine, "t", Value::Null).await.unwrap_err();
    let TemplateError::StepFailed { step, .. } = err else { panic!("expected StepFailed") };
    assert_eq!(step, "flaky");
}

/// Sub-template call: fresh scope seeded only with template_input; the
/// child's final output binds in the parent.
#[tokio::test]
async fn sub_template_passes_input_and_returns_output() {
    let engine = engine_with(Arc::new(EchoProvider), &[
        "
name: parent
steps:
  - name: seed
    prompt: 'payload'
  - name: call_child
    template: child
    template_input: '{{seed}}'
  - name: use_result
    prompt: 'child said {{call_child}}'
",
        "
name: child
steps:
  - name: respond
    prompt: 'processed {{input_data}}'
",
    ]);
    let output = run(&engine, "parent", Value::Null).await.unwrap();
    assert_eq!(output, json!("child said processed payload"));
}

/// Isolation: a child template cannot see parent bindings beyond
/// `input_data`.
#[tokio::test]
async fn sub_template_cannot_see_parent_bindings() {
    let engine = engine_with(Arc::new(EchoProvider), &[
        "
name: parent
steps:
  - name: secret
    prompt: 'classified'
  - name: call_child
    template: child
    template_input: 'x'
",
        "
name: child
steps:
  - name: leak
    prompt: 'I can see {{secret}}'
",
    ]);
    let err = run(&engine, "parent", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("secret") || err.to_string().contains("call_child"));
}

/// Unknown sub-template fails the calling step.
#[tokio::test]
async fn unknown_sub_template_fails() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: parent
steps:
  - name: call_child
    template: ghost
    template_input: 'x'
"]);
    let err = run(&engine, "parent", Value::Null).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

/// Built-in bindings: template metadata and stdin alias.
#[tokio::test]
async fn builtin_bindings_resolve() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: meta
version: '2.1'
steps:
  - name: show
    prompt: '{{template.name}} v{{template.version}} got {{stdin}}'
"]);
    let output = run(&engine, "meta", json!("hello")).await.unwrap();
    assert_eq!(output, json!("meta v2.1 got hello"));
}

/// Transform steps run without touching the provider.
#[tokio::test]
async fn transform_step_chains_into_prompt() {
    let provider = Arc::new(EchoProvider);
    let engine = engine_with(provider, &["
name: t
steps:
  - name: shortlist
    transform:
      operation: limit
      input: '{{input_data.items}}'
      count: 2
  - name: report
    prompt: 'top: {{shortlist}}'
"]);
    let output = run(&engine, "t", json!({"items": [1, 2, 3, 4]})).await.unwrap();
    assert_eq!(output, json!("top: [1,2]"));
}

/// Cancellation propagates as TemplateError::Cancelled and is never
/// absorbed by retry policies.
#[tokio::test]
async fn cancellation_stops_execution() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: t
steps:
  - name: s
    prompt: 'p'
    on_failure: retry
    max_retries: 5
"]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.run("t", Value::Null, &cancel).await.unwrap_err();
    assert!(matches!(err, TemplateError::Cancelled));
}

/// Undefined variable in a prompt fails the step (non-retryable by
/// policy default).
#[tokio::test]
async fn undefined_variable_fails_step() {
    let engine = engine_with(Arc::new(EchoProvider), &["
name: t
steps:
  - name: s
    prompt: 'value is {{missing.path}}'
"]);
    let err = run(&engine, "t", Value::Null).await.unwrap_err();
    let TemplateError::StepFailed { reason, .. } = err else { panic!("expected StepFailed") };
    assert!(reason.contains("missing.path"));
}
