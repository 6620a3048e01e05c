//! Minimal JSON-over-HTTP/1.1 RPC client.
//!
//! One TCP connection per call, driven by hyper's low-level `conn` API.
//! Each call is bounded by the client timeout end to end (connect, send,
//! and reading the full reply body).

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use pinwheel_core::RequestContext;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{RpcError, RpcResult};
use crate::proto::{RpcReply, RpcRequest, TOKEN_HEADER};

#[derive(Debug, Clone)]
pub struct RpcClient {
    /// `host:port` of the peer.
    address: String,
    timeout: Duration,
    token: Option<String>,
}

impl RpcClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// POST `payload` to `route` and decode the reply.
    pub async fn call<Req, Resp>(
        &self,
        route: &'static str,
        context: &RequestContext,
        payload: Req,
    ) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(&RpcRequest::new(context.clone(), payload)).map_err(|e| {
            RpcError::Codec {
                route,
                detail: e.to_string(),
            }
        })?;

        debug!(route, address = %self.address, request_id = %context.request_id, "rpc call");

        match tokio::time::timeout(self.timeout, self.exchange(route, body)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(route, address = %self.address, "rpc call timed out");
                Err(RpcError::Timeout {
                    route,
                    after: self.timeout,
                })
            }
        }
    }

    async fn exchange<Resp: DeserializeOwned>(&self, route: &'static str, body: Vec<u8>) -> RpcResult<Resp> {
        let transport = |detail: String| RpcError::Transport { route, detail };

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| transport(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| transport(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method("POST")
            .uri(format!("http://{}{route}", self.address))
            .header("host", self.address.as_str())
            .header("content-type", "application/json")
            .header("user-agent", "pinwheel-rpc/0.1");
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcError::Codec {
                route,
                detail: e.to_string(),
            })?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| transport(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| transport(e.to_string()))?
            .to_bytes();

        match serde_json::from_slice::<RpcReply<Resp>>(&bytes) {
            Ok(RpcReply::Ok(value)) => Ok(value),
            Ok(RpcReply::Error(fault)) => Err(RpcError::Remote(fault)),
            Err(e) => Err(RpcError::Codec {
                route,
                detail: format!("status {status}: {e}"),
            }),
        }
    }
}
