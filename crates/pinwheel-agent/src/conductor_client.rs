//! Agent → conductor calls.

use std::time::Duration;

use async_trait::async_trait;
use pinwheel_core::RequestContext;
use pinwheel_rpc::{
    ReconcileHostReply, ReconcileHostRequest, ReconcileInstanceReply, ReconcileInstanceRequest,
    ReconcileInstancesRequest, ReconcileSummary, RpcClient, RpcResult, routes,
};
use pinwheel_state::{HostRecord, InstanceRecord, MappingRecord};

/// The conductor operations an agent uses.
#[async_trait]
pub trait ConductorApi: Send + Sync {
    async fn reconcile_host(
        &self,
        ctx: &RequestContext,
        host: HostRecord,
    ) -> RpcResult<ReconcileHostReply>;

    async fn reconcile_instances(
        &self,
        ctx: &RequestContext,
        host_name: &str,
        instances: Vec<InstanceRecord>,
    ) -> RpcResult<ReconcileSummary>;

    async fn reconcile_instance(
        &self,
        ctx: &RequestContext,
        instance_uuid: &str,
        host: &str,
    ) -> RpcResult<Option<MappingRecord>>;
}

#[derive(Debug, Clone)]
pub struct HttpConductorClient {
    rpc: RpcClient,
}

impl HttpConductorClient {
    pub fn new(address: impl Into<String>, timeout: Duration, token: Option<String>) -> Self {
        Self {
            rpc: RpcClient::new(address, timeout).with_token(token),
        }
    }
}

#[async_trait]
impl ConductorApi for HttpConductorClient {
    async fn reconcile_host(
        &self,
        ctx: &RequestContext,
        host: HostRecord,
    ) -> RpcResult<ReconcileHostReply> {
        self.rpc
            .call(routes::RECONCILE_HOST, ctx, ReconcileHostRequest { host })
            .await
    }

    async fn reconcile_instances(
        &self,
        ctx: &RequestContext,
        host_name: &str,
        instances: Vec<InstanceRecord>,
    ) -> RpcResult<ReconcileSummary> {
        self.rpc
            .call(
                routes::RECONCILE_INSTANCES,
                ctx,
                ReconcileInstancesRequest {
                    host_name: host_name.to_string(),
                    instances,
                },
            )
            .await
    }

    async fn reconcile_instance(
        &self,
        ctx: &RequestContext,
        instance_uuid: &str,
        host: &str,
    ) -> RpcResult<Option<MappingRecord>> {
        let reply: ReconcileInstanceReply = self
            .rpc
            .call(
                routes::RECONCILE_INSTANCE,
                ctx,
                ReconcileInstanceRequest {
                    instance_uuid: instance_uuid.to_string(),
                    host: host.to_string(),
                },
            )
            .await?;
        Ok(reply.mapping)
    }
}
