//! MappingService — mapping lifecycle and reconciliation.
//!
//! Every operation that touches a mapping takes the per-instance lock first
//! and holds it through read → apply → finalize, so two reconciliations of
//! the same instance never interleave. Host and instance reports go straight
//! to the store's atomic upserts.
//!
//! An apply cycle always ends in a terminal status. Anything that keeps the
//! executor from answering `applied: true` (unknown host, timeout, transport
//! error, a rejected spec, a vCPU that would not pin) is recorded as
//! `FAILED` with the reason.

use std::sync::Arc;

use pinwheel_core::{KeyedLocks, RequestContext, validate};
use pinwheel_rpc::{CreateMappingRequest, ReconcileSummary};
use pinwheel_state::{
    HostRecord, InstanceRecord, MappingRecord, NewMapping, PowerState, StateError, StateStore, Upsert,
};
use tracing::{debug, info, warn};

use crate::error::{ConductorError, ConductorResult};
use crate::executor_client::ExecutorClient;
use crate::locator::InstanceLocator;

pub struct MappingService {
    store: StateStore,
    executor: Arc<dyn ExecutorClient>,
    locator: Arc<dyn InstanceLocator>,
    locks: KeyedLocks,
}

impl MappingService {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn ExecutorClient>,
        locator: Arc<dyn InstanceLocator>,
    ) -> Self {
        Self {
            store,
            executor,
            locator,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Mappings ───────────────────────────────────────────────────

    /// Record a desired mapping in `PENDING`.
    ///
    /// Only syntax is checked here; range checks against the host's CPU
    /// count happen when the owning executor compiles it. With
    /// `wait_until_active = false` the instance must already be running
    /// and the first apply cycle runs before this returns.
    pub async fn create_mapping(
        &self,
        ctx: &RequestContext,
        request: CreateMappingRequest,
    ) -> ConductorResult<MappingRecord> {
        validate(&request.cpu_mappings)?;

        let host = if request.wait_until_active {
            request.host.clone()
        } else {
            Some(self.resolve_active_host(ctx, &request).await?)
        };

        let uuid = request.instance_uuid.clone();
        let _guard = self.locks.lock(&uuid).await;

        let record = self
            .store
            .create_mapping(&NewMapping {
                instance_uuid: uuid.clone(),
                project_id: ctx.project_id.clone(),
                user_id: ctx.user_id.clone(),
                host: host.clone(),
                cpu_mappings: request.cpu_mappings,
            })
            .map_err(|e| match e {
                StateError::AlreadyExists(_) => ConductorError::MappingAlreadyExists(uuid.clone()),
                other => ConductorError::State(other),
            })?;
        info!(
            instance_uuid = %uuid,
            id = record.id,
            spec = %record.cpu_mappings,
            request_id = %ctx.request_id,
            "cpu mapping created"
        );

        match (request.wait_until_active, host) {
            (false, Some(host)) => self.apply_locked(ctx, record, &host).await,
            _ => Ok(record),
        }
    }

    /// Host of an instance that must already be running.
    ///
    /// The inventory wins when it knows the instance. A caller-supplied host
    /// is accepted for instances no tracker has reported yet.
    async fn resolve_active_host(
        &self,
        ctx: &RequestContext,
        request: &CreateMappingRequest,
    ) -> ConductorResult<String> {
        let uuid = &request.instance_uuid;
        match self.locator.locate(ctx, uuid).await? {
            Some(location) if location.status != PowerState::Running => {
                Err(ConductorError::InstanceNotActive {
                    uuid: uuid.clone(),
                    status: location.status.to_string(),
                })
            }
            Some(location) => Ok(location.host),
            None => request
                .host
                .clone()
                .ok_or_else(|| ConductorError::InstanceNotFound(uuid.clone())),
        }
    }

    /// Re-apply an instance's mapping on `host` after a lifecycle event.
    ///
    /// Returns `Ok(None)` when the instance has no mapping.
    pub async fn reconcile_instance(
        &self,
        ctx: &RequestContext,
        instance_uuid: &str,
        host: &str,
    ) -> ConductorResult<Option<MappingRecord>> {
        let _guard = self.locks.lock(instance_uuid).await;

        if self.store.get_mapping(instance_uuid)?.is_none() {
            debug!(%instance_uuid, "no cpu mapping, nothing to reconcile");
            return Ok(None);
        }

        let mapping = self.store.update_mapping(instance_uuid, |m| m.with_host(host))?;
        info!(%instance_uuid, %host, request_id = %ctx.request_id, "reconciling cpu mapping");
        self.apply_locked(ctx, mapping, host).await.map(Some)
    }

    /// Start a new apply cycle for an existing mapping on its recorded host.
    pub async fn reapply_mapping(
        &self,
        ctx: &RequestContext,
        instance_uuid: &str,
    ) -> ConductorResult<MappingRecord> {
        let _guard = self.locks.lock(instance_uuid).await;

        let mapping = self
            .store
            .get_mapping(instance_uuid)?
            .ok_or_else(|| ConductorError::MappingNotFound(instance_uuid.to_string()))?;
        let host = mapping.host.clone().ok_or_else(|| {
            ConductorError::HostNotFound(format!("mapping for {instance_uuid} has no host yet"))
        })?;
        info!(%instance_uuid, %host, previous = %mapping.status, "re-applying cpu mapping");
        self.apply_locked(ctx, mapping, &host).await
    }

    /// Run one apply cycle and persist its outcome. Caller holds the lock.
    async fn apply_locked(
        &self,
        ctx: &RequestContext,
        mapping: MappingRecord,
        host: &str,
    ) -> ConductorResult<MappingRecord> {
        let uuid = mapping.instance_uuid.clone();

        let outcome = match self.store.get_host(host) {
            Err(e) => Err(format!("host {host} lookup failed: {e}")),
            Ok(None) => Err(format!("host {host} has not reported to the conductor")),
            Ok(Some(host_record)) => {
                match self
                    .executor
                    .apply_instance_cpu_mapping(ctx, &host_record, &mapping)
                    .await
                {
                    Ok(reply) if reply.applied => Ok(()),
                    Ok(reply) => {
                        let failed: Vec<usize> = reply
                            .vcpu_results
                            .iter()
                            .enumerate()
                            .filter_map(|(vcpu, ok)| (!ok).then_some(vcpu))
                            .collect();
                        Err(format!("vcpus {failed:?} could not be pinned"))
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
        };

        let (applied, reason) = match outcome {
            Ok(()) => (true, None),
            Err(reason) => {
                warn!(instance_uuid = %uuid, %host, %reason, "cpu mapping apply failed");
                (false, Some(reason))
            }
        };

        let record = self
            .store
            .update_mapping(&uuid, |m| m.settled(applied, reason))?;
        info!(instance_uuid = %uuid, %host, status = %record.status, "cpu mapping apply finished");
        Ok(record)
    }

    pub fn get_mapping(&self, instance_uuid: &str) -> ConductorResult<MappingRecord> {
        self.store
            .get_mapping(instance_uuid)?
            .ok_or_else(|| ConductorError::MappingNotFound(instance_uuid.to_string()))
    }

    pub fn list_mappings(&self) -> ConductorResult<Vec<MappingRecord>> {
        Ok(self.store.list_mappings()?)
    }

    pub async fn delete_mapping(&self, instance_uuid: &str) -> ConductorResult<()> {
        let _guard = self.locks.lock(instance_uuid).await;
        if !self.store.delete_mapping(instance_uuid)? {
            return Err(ConductorError::MappingNotFound(instance_uuid.to_string()));
        }
        info!(%instance_uuid, "cpu mapping deleted");
        Ok(())
    }

    // ── Hosts & instances ──────────────────────────────────────────

    pub fn reconcile_host(&self, ctx: &RequestContext, host: &HostRecord) -> ConductorResult<Upsert> {
        let outcome = self.store.upsert_host(host)?;
        match &outcome {
            Upsert::Created => info!(host = %host.host_name, maxcpu = host.maxcpu, "host registered"),
            Upsert::Updated(fields) => {
                info!(host = %host.host_name, ?fields, request_id = %ctx.request_id, "host updated")
            }
            Upsert::Unchanged => debug!(host = %host.host_name, "host unchanged"),
        }
        Ok(outcome)
    }

    /// Upsert every instance reported by `host_name`. One bad record does not
    /// stop the rest.
    pub fn reconcile_instances(
        &self,
        ctx: &RequestContext,
        host_name: &str,
        instances: &[InstanceRecord],
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for instance in instances {
            let instance = if instance.host.as_deref() == Some(host_name) {
                instance.clone()
            } else {
                debug!(uuid = %instance.uuid, host = %host_name, "taking reporting host as instance host");
                InstanceRecord {
                    host: Some(host_name.to_string()),
                    ..instance.clone()
                }
            };
            match self.store.upsert_instance(&instance) {
                Ok(Upsert::Created) => summary.created += 1,
                Ok(Upsert::Updated(_)) => summary.updated += 1,
                Ok(Upsert::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    warn!(uuid = %instance.uuid, error = %e, "instance upsert failed");
                    summary.failed += 1;
                }
            }
        }
        debug!(
            host = %host_name,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            request_id = %ctx.request_id,
            "instances reconciled"
        );
        summary
    }

    pub fn get_host(&self, host_name: &str) -> ConductorResult<HostRecord> {
        self.store
            .get_host(host_name)?
            .ok_or_else(|| ConductorError::HostNotFound(host_name.to_string()))
    }

    pub fn list_hosts(&self) -> ConductorResult<Vec<HostRecord>> {
        Ok(self.store.list_hosts()?)
    }

    pub fn list_instances(&self) -> ConductorResult<Vec<InstanceRecord>> {
        Ok(self.store.list_instances()?)
    }
}
