//! Conductor → host pin executor calls.

use std::time::Duration;

use async_trait::async_trait;
use pinwheel_core::RequestContext;
use pinwheel_rpc::{ApplyMappingReply, ApplyMappingRequest, RpcClient, routes};
use pinwheel_state::{HostRecord, MappingRecord};

use crate::error::{ConductorError, ConductorResult};

/// Asks a host's pin executor to apply a mapping.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn apply_instance_cpu_mapping(
        &self,
        ctx: &RequestContext,
        host: &HostRecord,
        mapping: &MappingRecord,
    ) -> ConductorResult<ApplyMappingReply>;
}

/// Reaches executors at the `rpc_address` each host advertises.
#[derive(Debug, Clone)]
pub struct HttpExecutorClient {
    timeout: Duration,
    token: Option<String>,
}

impl HttpExecutorClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn apply_instance_cpu_mapping(
        &self,
        ctx: &RequestContext,
        host: &HostRecord,
        mapping: &MappingRecord,
    ) -> ConductorResult<ApplyMappingReply> {
        let address = host.rpc_address.as_deref().ok_or_else(|| {
            ConductorError::HostNotFound(format!("{} advertises no rpc address", host.host_name))
        })?;
        let client = RpcClient::new(address, self.timeout).with_token(self.token.clone());
        let reply = client
            .call(
                routes::APPLY_MAPPING,
                ctx,
                ApplyMappingRequest {
                    mapping: mapping.clone(),
                },
            )
            .await?;
        Ok(reply)
    }
}
