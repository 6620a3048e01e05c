//! pinwheel-rpc — the wire protocol between agents and the conductor.
//!
//! Every operation is an HTTP/1.1 `POST` of a JSON [`RpcRequest`] envelope
//! to a fixed route under `/rpc/v1/`; the reply body is always an
//! [`RpcReply`]. The envelope carries the protocol version and the caller's
//! [`RequestContext`](pinwheel_core::RequestContext); a shared token, when
//! configured, travels in the `x-pinwheel-token` header.

pub mod client;
pub mod error;
pub mod proto;
pub mod server;

pub use client::RpcClient;
pub use error::{RpcError, RpcResult};
pub use proto::*;
