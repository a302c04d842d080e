#![deny(missing_docs)]
//! Newline-delimited JSON-RPC 2.0 for tether.
//!
//! Three layers, each usable on its own:
//!
//! - [`codec`]: frame model and line-level encode/decode.
//! - [`transport`]: duplex framed byte streams over child-process stdio and
//!   local unix sockets, plus an in-memory pair for tests.
//! - [`dispatch`]: the client side. Id allocation, response correlation,
//!   deadlines, and notification routing.

pub mod codec;
pub mod dispatch;
pub mod transport;

pub use codec::{
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, RpcErrorObject, RpcFrame, RpcId,
};
pub use dispatch::{NotificationHandler, RpcClient};
pub use transport::{
    ChildSpec, ChildTransport, SocketListener, StdioTransport, Transport, UnixTransport,
};
