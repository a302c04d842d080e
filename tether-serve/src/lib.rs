#![deny(missing_docs)]
//! Exposed-as-server mode.
//!
//! Runs the orchestrator as a tool server: configured templates are
//! advertised over `tools/list`, executed on `tools/call`, observable
//! through the `tasks/*` methods, and long calls emit
//! `notifications/progress` heartbeats when the caller supplies a
//! progress token.

pub mod service;
pub mod tasks;

pub use service::{ExposedArg, PROTOCOL_VERSION, ServeOptions, TemplateServer, ToolExposure};
pub use tasks::{TaskSnapshot, TaskStatus, TaskTable};
