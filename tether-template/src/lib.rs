#![deny(missing_docs)]
//! YAML workflow templates for tether.
//!
//! A template is a named sequence of steps (provider prompts,
//! sub-template calls, parallel groups, for-each loops, and data
//! transforms) executed against a variable scope with `{{path}}`
//! substitution, per-step conditions, and per-step failure policies.

pub mod exec;
pub mod model;
pub mod registry;
pub mod vars;

pub use exec::{EngineConfig, TemplateEngine};
pub use model::{
    Aggregate, Defaults, OnFailure, ParallelGroup, RetryBackoff, Step, StepKind, Template,
    TemplateConfig, Transform, TransformOp,
};
pub use registry::TemplateRegistry;
pub use vars::{Scope, evaluate_condition, render};
