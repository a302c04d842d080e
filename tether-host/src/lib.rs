#![deny(missing_docs)]
//! Tool-server host for tether.
//!
//! Supervises a set of tool-server subprocesses: spawn, initialize
//! handshake, catalog discovery with retry, wire-named invocation, and
//! graceful shutdown. Wire naming lives in [`wire_name`] so the encode
//! and decode directions cannot drift apart.

pub mod connection;
pub mod host;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
pub mod wire_name;

pub use connection::{PROTOCOL_VERSION, ServerConnection, ServerSpec, ServerState, ServerTool};
pub use host::{DEFAULT_TOOL_DEADLINE, MIN_DEADLINE_SLICE, ServerHost};
