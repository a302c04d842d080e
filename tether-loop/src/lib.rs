#![deny(missing_docs)]
//! The tool-dispatch loop.
//!
//! One user turn in, one final assistant text out. In between: provider
//! completion, execution of every issued tool call against the host, a
//! `tool` message appended for every call id (success or failure), and a
//! bounded number of follow-up completions.

mod config;
mod dispatch;

pub use config::LoopConfig;
pub use dispatch::{DispatchLoop, DispatchOutcome};
