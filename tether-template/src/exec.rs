//! Template execution.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use tether_context::ConversationState;
use tether_host::ServerHost;
use tether_loop::{DispatchLoop, LoopConfig};
use tether_types::{CompletionRequest, LoopError, Message, Provider, TemplateError};

use crate::model::{Aggregate, OnFailure, RetryBackoff, Step, StepKind, Template, TransformOp};
use crate::registry::TemplateRegistry;
use crate::vars::{Scope, evaluate_condition, is_truthy, render, value_to_string};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum sub-template nesting.
    pub max_call_depth: usize,
    /// Deadline for tool calls made by prompt steps.
    pub tool_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_call_depth: 8, tool_deadline: Duration::from_secs(30) }
    }
}

/// Executes templates against a provider and (optionally) a tool-server
/// host.
pub struct TemplateEngine {
    registry: Arc<TemplateRegistry>,
    provider: Arc<dyn Provider>,
    host: Option<Arc<ServerHost>>,
    config: EngineConfig,
}

impl TemplateEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        registry: Arc<TemplateRegistry>,
        provider: Arc<dyn Provider>,
        host: Option<Arc<ServerHost>>,
        config: EngineConfig,
    ) -> Self {
        Self { registry, provider, host, config }
    }

    /// The registry this engine resolves sub-templates against.
    #[must_use]
    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    /// Run a registered template by name.
    ///
    /// # Errors
    ///
    /// [`TemplateError::NotFound`] for unknown names, otherwise whatever
    /// execution produces.
    pub async fn run(
        &self,
        name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        let template = self
            .registry
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?
            .clone();
        self.run_template(&template, input, cancel).await
    }

    /// Run a template value directly.
    ///
    /// # Errors
    ///
    /// Step failures per each step's `on_failure` policy,
    /// [`TemplateError::Cancelled`] on cancellation.
    pub async fn run_template(
        &self,
        template: &Template,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        self.run_scoped(template, input, 0, cancel).await
    }

    /// Boxed for indirect recursion through sub-template calls.
    fn run_scoped<'a>(
        &'a self,
        template: &'a Template,
        input: Value,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Value, TemplateError>> {
        Box::pin(async move {
            if depth > self.config.max_call_depth {
                return Err(TemplateError::CallDepthExceeded(self.config.max_call_depth));
            }

            let mut scope = Scope::new();
            scope.insert("input_data", input.clone());
            scope.insert("stdin", input);
            scope.insert(
                "template",
                json!({
                    "name": template.name,
                    "version": template.version.clone().unwrap_or_default(),
                }),
            );
            scope.insert(
                "execution",
                json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
            );
            for (name, value) in &template.config.defaults.variables {
                scope.insert(name.clone(), value.clone());
            }

            let mut last_output = Value::Null;
            for step in &template.steps {
                if cancel.is_cancelled() {
                    return Err(TemplateError::Cancelled);
                }
                if let Some(condition) = &step.condition
                    && !evaluate_condition(condition, &scope)
                {
                    tracing::debug!(step = %step.name, "condition false, skipping");
                    continue;
                }
                tracing::debug!(step = %step.name, "running step");
                let outcome = self.exec_with_policy(step, &scope, template, depth, cancel).await?;
                // Parallel groups surface their children's outputs as
                // extra bindings once the whole group has joined.
                for (name, value) in outcome.bindings {
                    scope.insert(name, value);
                }
                scope.insert(step.output_name().to_string(), outcome.value.clone());
                last_output = outcome.value;
            }
            Ok(last_output)
        })
    }

    /// Run one step under its failure policy.
    ///
    /// Boxed to break the mutual recursion with [`Self::exec_parallel`]
    /// (parallel steps spawn child futures that call back into this
    /// method), which would otherwise leave the compiler unable to prove
    /// the resulting future is `Send`.
    fn exec_with_policy<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a Scope,
        template: &'a Template,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepOutcome, TemplateError>> {
        async move {
            let attempts = match step.on_failure {
                OnFailure::Retry => 1 + step.max_retries,
                _ => 1,
            };
            let mut last_error: Option<TemplateError> = None;

            for attempt in 1..=attempts {
                if attempt > 1 {
                    tokio::time::sleep(retry_delay(step, attempt)).await;
                }
                match self.exec_body(step, scope, template, depth, cancel).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(TemplateError::Cancelled) => return Err(TemplateError::Cancelled),
                    Err(err) => {
                        tracing::warn!(step = %step.name, attempt, error = %err, "step attempt failed");
                        last_error = Some(err);
                    }
                }
            }

            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            match step.on_failure {
                OnFailure::Continue => {
                    Ok(StepOutcome::value(step.default_output.clone().unwrap_or(Value::Null)))
                }
                OnFailure::Retry if step.default_output.is_some() => {
                    Ok(StepOutcome::value(step.default_output.clone().unwrap_or(Value::Null)))
                }
                _ => Err(TemplateError::StepFailed { step: step.name.clone(), reason }),
            }
        }
        .boxed()
    }

    /// One attempt at a step body.
    ///
    /// Boxed for the same reason as [`Self::exec_with_policy`]: it sits
    /// in the mutual-recursion cycle with [`Self::exec_parallel`].
    fn exec_body<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a Scope,
        template: &'a Template,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepOutcome, TemplateError>> {
        async move {
            match step.kind()? {
                StepKind::Prompt => {
                    self.exec_prompt(step, scope, template, cancel).await.map(StepOutcome::value)
                }
                StepKind::Call => {
                    self.exec_call(step, scope, depth, cancel).await.map(StepOutcome::value)
                }
                StepKind::ForEach => {
                    self.exec_for_each(step, scope, template, cancel).await.map(StepOutcome::value)
                }
                StepKind::Transform => exec_transform(step, scope).map(StepOutcome::value),
                StepKind::Parallel => {
                    self.exec_parallel(step, scope, template, depth, cancel).await
                }
            }
        }
        .boxed()
    }

    async fn exec_prompt(
        &self,
        step: &Step,
        scope: &Scope,
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        let prompt = match &step.prompt {
            Some(body) => render(body, scope)?,
            None => return Err(TemplateError::Parse(format!("step {} has no prompt", step.name))),
        };
        let system_prompt = match &step.system_prompt {
            Some(body) => render(body, scope)?,
            None => String::new(),
        };
        let defaults = &template.config.defaults;

        if !step.servers.is_empty()
            && let Some(host) = &self.host
        {
            let subset = Arc::new(host.subset(&step.servers));
            let config = LoopConfig {
                tool_deadline: self.config.tool_deadline,
                temperature: defaults.temperature,
                max_tokens: defaults.max_tokens,
                ..LoopConfig::default()
            };
            let dispatch = DispatchLoop::new(Arc::clone(&self.provider), subset, config);
            let mut state = ConversationState::new(system_prompt);
            let outcome = dispatch.run(&mut state, &prompt, cancel).await.map_err(|e| match e {
                LoopError::Cancelled => TemplateError::Cancelled,
                LoopError::Provider(p) => TemplateError::Provider(p),
                LoopError::Host(h) => TemplateError::StepFailed {
                    step: step.name.clone(),
                    reason: h.to_string(),
                },
            })?;
            return Ok(Value::String(outcome.response));
        }

        let request = CompletionRequest {
            messages: vec![Message::user(prompt)],
            tools: vec![],
            system_prompt,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            stream: false,
        };
        let response = self.provider.complete(request).await?;
        Ok(Value::String(response.text))
    }

    async fn exec_call(
        &self,
        step: &Step,
        scope: &Scope,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        let (Some(name), Some(input_expr)) = (&step.template, &step.template_input) else {
            return Err(TemplateError::Parse(format!("step {} is not a call", step.name)));
        };
        let rendered = render(input_expr, scope)?;
        // A rendered input that is valid JSON passes through typed;
        // otherwise the sub-template sees the raw string.
        let input = serde_json::from_str(&rendered).unwrap_or(Value::String(rendered));
        let sub = self
            .registry
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.clone()))?
            .clone();
        self.run_scoped(&sub, input, depth + 1, cancel).await
    }

    async fn exec_for_each(
        &self,
        step: &Step,
        scope: &Scope,
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<Value, TemplateError> {
        let Some(expr) = &step.for_each else {
            return Err(TemplateError::Parse(format!("step {} is not a loop", step.name)));
        };
        let path = expr
            .trim()
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .map_or(expr.trim(), str::trim);
        let items = match scope.resolve(path) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(TemplateError::TypeMismatch {
                    context: format!("for_each in step {}", step.name),
                    expected: "array".into(),
                });
            }
            None => return Err(TemplateError::VariableMissing(path.to_string())),
        };

        let item_name = step.item_name.as_deref().unwrap_or("item");
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TemplateError::Cancelled);
            }
            let mut iteration = scope.clone();
            iteration.insert(item_name, item);
            iteration.insert("index", json!(index));
            iteration.insert("first", json!(index == 0));
            iteration.insert("last", json!(index + 1 == total));
            iteration.insert("total", json!(total));
            results.push(self.exec_prompt(step, &iteration, template, cancel).await?);
        }
        Ok(Value::Array(results))
    }

    async fn exec_parallel(
        &self,
        step: &Step,
        scope: &Scope,
        template: &Template,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, TemplateError> {
        let Some(group) = &step.parallel else {
            return Err(TemplateError::Parse(format!("step {} is not a group", step.name)));
        };

        // Every child sees the same pre-group snapshot; the parent
        // scope picks up child outputs only after the join, via the
        // outcome's extra bindings.
        let snapshot = scope.clone();
        let children = group.steps.iter().map(|child| {
            let snapshot = snapshot.clone();
            let fut: BoxFuture<'_, Result<(&Step, Option<Value>), TemplateError>> =
                Box::pin(async move {
                    if let Some(condition) = &child.condition
                        && !evaluate_condition(condition, &snapshot)
                    {
                        return Ok((child, None));
                    }
                    let outcome = self
                        .exec_with_policy(child, &snapshot, template, depth, cancel)
                        .await?;
                    Ok((child, Some(outcome.value)))
                });
            fut
        });

        // `buffered` keeps declared order while running up to
        // max_concurrent children at once; `try_collect` stops at the
        // first fatal child and drops the stream, cancelling any
        // children still in flight.
        let results: Vec<(&Step, Option<Value>)> = futures::stream::iter(children)
            .buffered(group.max_concurrent)
            .try_collect()
            .await?;

        let bindings: Vec<(String, Value)> = results
            .iter()
            .filter_map(|(child, value)| {
                value.as_ref().map(|v| (child.output_name().to_string(), v.clone()))
            })
            .collect();

        let value = match group.aggregate {
            Aggregate::Array => {
                Value::Array(results.into_iter().map(|(_, v)| v.unwrap_or(Value::Null)).collect())
            }
            Aggregate::Merge => {
                let mut merged = String::new();
                for (child, value) in results {
                    let Some(value) = value else { continue };
                    merged.push_str(&format!("### {}\n{}\n\n", child.name, value_to_string(&value)));
                }
                Value::String(merged.trim_end().to_string())
            }
        };
        Ok(StepOutcome { value, bindings })
    }
}

/// A step's result: its value plus any extra scope bindings (parallel
/// child outputs).
struct StepOutcome {
    value: Value,
    bindings: Vec<(String, Value)>,
}

impl StepOutcome {
    fn value(value: Value) -> Self {
        Self { value, bindings: Vec::new() }
    }
}

/// Delay before retry `attempt` (attempt 2 is the first retry).
fn retry_delay(step: &Step, attempt: u32) -> Duration {
    let base = Duration::from_secs_f64(step.initial_delay.unwrap_or(1.0).max(0.0));
    match step.retry_backoff {
        RetryBackoff::Linear => base * (attempt - 1),
        RetryBackoff::Exponential => base * 2u32.saturating_pow(attempt.saturating_sub(2)),
    }
}

/// Apply a transform step. Pure; no provider involvement.
fn exec_transform(step: &Step, scope: &Scope) -> Result<Value, TemplateError> {
    let Some(transform) = &step.transform else {
        return Err(TemplateError::Parse(format!("step {} is not a transform", step.name)));
    };
    let path = transform
        .input
        .trim()
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map_or(transform.input.trim(), str::trim);
    let input = scope
        .resolve(path)
        .cloned()
        .ok_or_else(|| TemplateError::VariableMissing(path.to_string()))?;

    let mismatch = |expected: &str| TemplateError::TypeMismatch {
        context: format!("transform in step {}", step.name),
        expected: expected.into(),
    };

    match transform.operation {
        TransformOp::Limit => {
            let Value::Array(items) = input else { return Err(mismatch("array")) };
            let count = transform.count.unwrap_or(items.len());
            Ok(Value::Array(items.into_iter().take(count).collect()))
        }
        TransformOp::Filter => {
            let Value::Array(items) = input else { return Err(mismatch("array")) };
            let field = transform.field.as_deref();
            let kept = items
                .into_iter()
                .filter(|item| {
                    let target = match field {
                        Some(field) => item.get(field),
                        None => Some(item),
                    };
                    match (&transform.equals, target) {
                        (Some(expected), Some(actual)) => actual == expected,
                        (None, Some(actual)) => is_truthy(actual),
                        (_, None) => false,
                    }
                })
                .collect();
            Ok(Value::Array(kept))
        }
        TransformOp::Pluck => {
            let Value::Array(items) = input else { return Err(mismatch("array")) };
            let field = transform.field.as_deref().ok_or_else(|| {
                TemplateError::Parse(format!("pluck in step {} needs a field", step.name))
            })?;
            Ok(Value::Array(
                items.into_iter().map(|item| item.get(field).cloned().unwrap_or(Value::Null)).collect(),
            ))
        }
        TransformOp::Group => {
            let Value::Array(items) = input else { return Err(mismatch("array")) };
            let field = transform.field.as_deref().ok_or_else(|| {
                TemplateError::Parse(format!("group in step {} needs a field", step.name))
            })?;
            let mut groups = serde_json::Map::new();
            for item in items {
                let key = item
                    .get(field)
                    .map(value_to_string)
                    .unwrap_or_else(|| "null".to_string());
                if let Some(group) =
                    groups.entry(key).or_insert_with(|| Value::Array(vec![])).as_array_mut()
                {
                    group.push(item);
                }
            }
            Ok(Value::Object(groups))
        }
    }
}
