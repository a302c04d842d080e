//! Template file model.
//!
//! Templates are YAML. Unknown keys are configuration errors
//! (`deny_unknown_fields` everywhere), and structural rules the type
//! system cannot express (one kind per step, unique names, backward
//! `depends_on` references) are checked by [`Template::validate`].

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use tether_types::TemplateError;

/// A declarative multi-step workflow.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    /// Unique template name; sub-template calls resolve against it.
    pub name: String,
    /// Template version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Execution defaults.
    #[serde(default)]
    pub config: TemplateConfig,
    /// The steps, executed in declared order.
    pub steps: Vec<Step>,
}

/// The `config` block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    /// Default execution parameters and named variables.
    #[serde(default)]
    pub defaults: Defaults,
}

/// The `config.defaults` block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Provider name override.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Output token limit.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Named variables seeded into the scope.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

/// How a failing step is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Fail the template (default).
    #[default]
    Stop,
    /// Bind `default_output` (or null) and keep going.
    Continue,
    /// Retry per the backoff settings, then fall back to
    /// `default_output` when present, else fail.
    Retry,
}

/// Delay growth between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// delay, 2×delay, 3×delay, …
    #[default]
    Linear,
    /// delay, 2×delay, 4×delay, …
    Exponential,
}

/// How a parallel group combines child outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    /// Concatenated text with per-child headers.
    #[default]
    Merge,
    /// JSON array ordered by child declaration order.
    Array,
}

/// A parallel group body.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelGroup {
    /// Child steps. Unordered among themselves.
    pub steps: Vec<Step>,
    /// Concurrency bound.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Output combination mode.
    #[serde(default)]
    pub aggregate: Aggregate,
}

fn default_max_concurrent() -> usize {
    4
}

/// A typed data transform (no provider call).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transform {
    /// The operation to apply.
    pub operation: TransformOp,
    /// Expression resolving to the input value.
    pub input: String,
    /// Field name for `filter`/`pluck`/`group`.
    #[serde(default)]
    pub field: Option<String>,
    /// Comparison value for `filter`.
    #[serde(default)]
    pub equals: Option<serde_json::Value>,
    /// Item limit for `limit`.
    #[serde(default)]
    pub count: Option<usize>,
}

/// Transform operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformOp {
    /// Keep array items whose `field` matches `equals` (or is truthy).
    Filter,
    /// Keep the first `count` items.
    Limit,
    /// Map each item to its `field`.
    Pluck,
    /// Group items into an object keyed by each item's `field`.
    Group,
}

/// One step. Exactly one kind (prompt, sub-template call, parallel
/// group, for-each loop, or transform) plus common controls.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Step name, unique within the template.
    pub name: String,

    // -- prompt step (also the body of a for-each) --
    /// Prompt body with `{{placeholders}}`.
    #[serde(default)]
    pub prompt: Option<String>,
    /// System prompt for this step.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Tool servers enabled for this step's completion.
    #[serde(default)]
    pub servers: Vec<String>,

    // -- sub-template call --
    /// Name of the template to invoke.
    #[serde(default)]
    pub template: Option<String>,
    /// Expression rendered into the sub-template's `input_data`.
    #[serde(default)]
    pub template_input: Option<String>,

    // -- parallel group --
    /// Parallel children.
    #[serde(default)]
    pub parallel: Option<ParallelGroup>,

    // -- for-each loop --
    /// Expression resolving to the array to iterate.
    #[serde(default)]
    pub for_each: Option<String>,
    /// Loop variable name (default `item`).
    #[serde(default)]
    pub item_name: Option<String>,

    // -- transform --
    /// Data transform.
    #[serde(default)]
    pub transform: Option<Transform>,

    // -- common controls --
    /// Scope binding for the result (defaults to the step name).
    #[serde(default)]
    pub output: Option<String>,
    /// Skip the step unless this condition holds.
    #[serde(default)]
    pub condition: Option<String>,
    /// Explicit ordering dependencies (must name earlier steps).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Failure policy.
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Retry attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Retry delay growth.
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
    /// Delay before the first retry, in seconds.
    #[serde(default)]
    pub initial_delay: Option<f64>,
    /// Fallback value bound when the policy absorbs a failure.
    #[serde(default)]
    pub default_output: Option<serde_json::Value>,
}

/// The kind of a step, derived from which body fields are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Provider completion.
    Prompt,
    /// Sub-template invocation.
    Call,
    /// Parallel group.
    Parallel,
    /// For-each loop.
    ForEach,
    /// Data transform.
    Transform,
}

impl Step {
    /// The binding name for this step's output.
    #[must_use]
    pub fn output_name(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }

    /// Derive the step kind, or fail when the body is ambiguous.
    ///
    /// # Errors
    ///
    /// [`TemplateError::Parse`] for zero or multiple kinds.
    pub fn kind(&self) -> Result<StepKind, TemplateError> {
        // for_each + prompt is one kind: the prompt is the loop body.
        let has_loop = self.for_each.is_some();
        let markers = [
            (!has_loop && self.prompt.is_some(), StepKind::Prompt),
            (self.template.is_some(), StepKind::Call),
            (self.parallel.is_some(), StepKind::Parallel),
            (has_loop, StepKind::ForEach),
            (self.transform.is_some(), StepKind::Transform),
        ];
        let mut kinds = markers.iter().filter(|(set, _)| *set).map(|(_, kind)| *kind);
        match (kinds.next(), kinds.next()) {
            (Some(kind), None) => Ok(kind),
            (None, _) => Err(TemplateError::Parse(format!(
                "step {} has no body (prompt, template, parallel, for_each, or transform)",
                self.name
            ))),
            (Some(_), Some(_)) => Err(TemplateError::Parse(format!(
                "step {} mixes multiple step kinds",
                self.name
            ))),
        }
    }
}

impl Template {
    /// Parse a template from YAML text and validate it.
    ///
    /// # Errors
    ///
    /// [`TemplateError::Parse`] for YAML errors, unknown keys, and
    /// structural violations.
    pub fn from_yaml_str(text: &str) -> Result<Self, TemplateError> {
        let template: Template =
            serde_yaml::from_str(text).map_err(|e| TemplateError::Parse(e.to_string()))?;
        template.validate()?;
        Ok(template)
    }

    /// Parse a template file.
    ///
    /// # Errors
    ///
    /// I/O failures and everything [`from_yaml_str`](Self::from_yaml_str)
    /// rejects.
    pub fn from_yaml_file(path: &Path) -> Result<Self, TemplateError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    /// Structural validation beyond what serde enforces.
    ///
    /// # Errors
    ///
    /// [`TemplateError::Parse`] on the first violation found.
    pub fn validate(&self) -> Result<(), TemplateError> {
        validate_steps(&self.steps, true)
    }
}

fn validate_steps(steps: &[Step], allow_parallel: bool) -> Result<(), TemplateError> {
    let mut seen: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for step in steps {
        if !seen.insert(&step.name) {
            return Err(TemplateError::Parse(format!("duplicate step name: {}", step.name)));
        }
        let kind = step.kind()?;
        match kind {
            StepKind::ForEach if step.prompt.is_none() => {
                return Err(TemplateError::Parse(format!(
                    "for_each step {} needs a prompt body",
                    step.name
                )));
            }
            StepKind::Call if step.template_input.is_none() => {
                return Err(TemplateError::Parse(format!(
                    "call step {} needs template_input",
                    step.name
                )));
            }
            StepKind::Parallel => {
                if !allow_parallel {
                    return Err(TemplateError::Parse(format!(
                        "step {} nests a parallel group inside a parallel group",
                        step.name
                    )));
                }
                let Some(group) = step.parallel.as_ref() else { continue };
                if group.steps.is_empty() {
                    return Err(TemplateError::Parse(format!(
                        "parallel step {} has no children",
                        step.name
                    )));
                }
                if group.max_concurrent == 0 {
                    return Err(TemplateError::Parse(format!(
                        "parallel step {} has max_concurrent 0",
                        step.name
                    )));
                }
                validate_steps(&group.steps, false)?;
            }
            _ => {}
        }
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(TemplateError::Parse(format!(
                    "step {} depends on {dep}, which is not an earlier step",
                    step.name
                )));
            }
        }
    }
    Ok(())
}
