//! RPC client errors.

use std::time::Duration;

use thiserror::Error;

use crate::proto::RpcFault;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{route} timed out after {after:?}")]
    Timeout { route: &'static str, after: Duration },

    #[error("transport error calling {route}: {detail}")]
    Transport { route: &'static str, detail: String },

    #[error("remote error: {0}")]
    Remote(RpcFault),

    #[error("codec error calling {route}: {detail}")]
    Codec { route: &'static str, detail: String },
}
