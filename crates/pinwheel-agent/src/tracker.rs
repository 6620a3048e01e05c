//! HostResourceTracker — periodic host and instance report.
//!
//! Each pass reads the host's NUMA topology and CPU count, then walks the
//! active domains collecting run state and per-vCPU affinity. The host
//! snapshot is sent first, the instance batch second. A domain that cannot
//! be read is logged and left out; the pass carries on. Mapping status is
//! never touched here.

use std::sync::Arc;
use std::time::Duration;

use pinwheel_core::{RequestContext, epoch_secs};
use pinwheel_hypervisor::{Hypervisor, HypervisorResult};
use pinwheel_rpc::ReconcileSummary;
use pinwheel_state::{HostRecord, InstanceRecord, PowerState};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::conductor_client::ConductorApi;
use crate::error::TrackerError;

/// What one pass reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerReport {
    pub host_created: bool,
    pub instances: usize,
    pub skipped: Vec<String>,
    pub summary: ReconcileSummary,
}

pub struct HostResourceTracker {
    hypervisor: Arc<dyn Hypervisor>,
    conductor: Arc<dyn ConductorApi>,
    host_name: String,
    advertise: Option<String>,
    interval: Duration,
    run_immediately: bool,
}

impl HostResourceTracker {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        conductor: Arc<dyn ConductorApi>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            hypervisor,
            conductor,
            host_name: host_name.into(),
            advertise: None,
            interval: Duration::from_secs(60),
            run_immediately: true,
        }
    }

    /// Address the conductor should use to reach this host's executor.
    pub fn with_advertise(mut self, address: impl Into<String>) -> Self {
        self.advertise = Some(address.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }

    pub async fn collect_host(&self) -> HypervisorResult<HostRecord> {
        Ok(HostRecord {
            host_name: self.host_name.clone(),
            cpu_topology: self.hypervisor.numa_topology().await?,
            maxcpu: self.hypervisor.max_cpus().await?,
            rpc_address: self.advertise.clone(),
            updated_at: epoch_secs(),
        })
    }

    async fn collect_instance(&self, uuid: &str) -> HypervisorResult<InstanceRecord> {
        let info = self.hypervisor.domain_info(uuid).await?;
        let pins = self.hypervisor.vcpu_pin_info(uuid).await?;
        Ok(InstanceRecord {
            uuid: uuid.to_string(),
            host: Some(self.host_name.clone()),
            status: PowerState::from_code(info.state_code),
            cpu_mappings: pins
                .into_iter()
                .enumerate()
                .map(|(vcpu, map)| (vcpu as u32, map))
                .collect(),
            updated_at: epoch_secs(),
        })
    }

    /// Snapshot every active domain. Returns the readable ones and the UUIDs
    /// that failed.
    pub async fn collect_instances(&self) -> HypervisorResult<(Vec<InstanceRecord>, Vec<String>)> {
        let mut instances = Vec::new();
        let mut skipped = Vec::new();
        for uuid in self.hypervisor.active_domains().await? {
            match self.collect_instance(&uuid).await {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    warn!(instance_uuid = %uuid, error = %e, "skipping domain in resource report");
                    skipped.push(uuid);
                }
            }
        }
        Ok((instances, skipped))
    }

    /// One full pass: host report, then instance report.
    pub async fn report_once(&self) -> Result<TrackerReport, TrackerError> {
        let ctx = RequestContext::service("tracker");

        let host = self.collect_host().await?;
        let host_reply = self.conductor.reconcile_host(&ctx, host).await?;

        let (instances, skipped) = self.collect_instances().await?;
        let count = instances.len();
        let summary = self
            .conductor
            .reconcile_instances(&ctx, &self.host_name, instances)
            .await?;

        debug!(
            host = %self.host_name,
            instances = count,
            skipped = skipped.len(),
            created = summary.created,
            updated = summary.updated,
            "resource report sent"
        );
        Ok(TrackerReport {
            host_created: host_reply.created,
            instances: count,
            skipped,
            summary,
        })
    }

    /// Report every `interval` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.host_name,
            interval_secs = self.interval.as_secs(),
            backend = self.hypervisor.name(),
            "resource tracker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.run_immediately {
            // The first tick fires at once; consume it.
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report_once().await {
                        warn!(error = %e, "resource report failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource tracker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pinwheel_core::CpuMap;
    use pinwheel_hypervisor::SimulatedHypervisor;
    use pinwheel_rpc::{FaultKind, ReconcileHostReply, RpcError, RpcFault, RpcResult};
    use pinwheel_state::MappingRecord;

    use super::*;

    #[derive(Default)]
    struct RecordingConductor {
        hosts: Mutex<Vec<HostRecord>>,
        batches: Mutex<Vec<Vec<InstanceRecord>>>,
        reject_hosts: bool,
    }

    #[async_trait]
    impl ConductorApi for RecordingConductor {
        async fn reconcile_host(&self, _ctx: &RequestContext, host: HostRecord) -> RpcResult<ReconcileHostReply> {
            if self.reject_hosts {
                return Err(RpcError::Remote(RpcFault::new(FaultKind::Internal, "store down")));
            }
            let created = self.hosts.lock().unwrap().is_empty();
            self.hosts.lock().unwrap().push(host);
            Ok(ReconcileHostReply {
                created,
                changed_fields: Vec::new(),
            })
        }

        async fn reconcile_instances(
            &self,
            _ctx: &RequestContext,
            _host_name: &str,
            instances: Vec<InstanceRecord>,
        ) -> RpcResult<ReconcileSummary> {
            let created = instances.len();
            self.batches.lock().unwrap().push(instances);
            Ok(ReconcileSummary {
                created,
                ..Default::default()
            })
        }

        async fn reconcile_instance(
            &self,
            _ctx: &RequestContext,
            _instance_uuid: &str,
            _host: &str,
        ) -> RpcResult<Option<MappingRecord>> {
            Ok(None)
        }
    }

    fn tracker(hv: Arc<SimulatedHypervisor>, conductor: Arc<RecordingConductor>) -> HostResourceTracker {
        HostResourceTracker::new(hv, conductor, "compute-1").with_advertise("10.0.0.1:7421")
    }

    #[tokio::test]
    async fn reports_topology_and_running_domains() {
        let hv = Arc::new(
            SimulatedHypervisor::new("compute-1", 2, 2)
                .with_domain("vm-a", 1, 2)
                .with_domain("vm-off", 5, 1),
        );
        let conductor = Arc::new(RecordingConductor::default());

        let report = tracker(hv, conductor.clone()).report_once().await.unwrap();
        assert!(report.host_created);
        assert_eq!(report.instances, 1);
        assert!(report.skipped.is_empty());

        let host = conductor.hosts.lock().unwrap()[0].clone();
        assert_eq!(host.maxcpu, 4);
        assert_eq!(host.cpu_topology[&1], vec![2, 3]);
        assert_eq!(host.rpc_address.as_deref(), Some("10.0.0.1:7421"));

        let batch = conductor.batches.lock().unwrap()[0].clone();
        assert_eq!(batch[0].uuid, "vm-a");
        assert_eq!(batch[0].status, PowerState::Running);
        assert_eq!(batch[0].cpu_mappings.len(), 2);
        assert_eq!(batch[0].cpu_mappings[&0], CpuMap::full(4));
    }

    #[tokio::test]
    async fn unreadable_domain_is_skipped() {
        let hv = Arc::new(
            SimulatedHypervisor::new("compute-1", 1, 4)
                .with_domain("vm-a", 1, 1)
                .with_domain("vm-b", 1, 1)
                .with_domain("vm-c", 1, 1),
        );
        hv.fail_domain_info("vm-b");
        let conductor = Arc::new(RecordingConductor::default());

        let report = tracker(hv, conductor.clone()).report_once().await.unwrap();
        assert_eq!(report.instances, 2);
        assert_eq!(report.skipped, vec!["vm-b".to_string()]);

        let uuids: Vec<String> = conductor.batches.lock().unwrap()[0]
            .iter()
            .map(|i| i.uuid.clone())
            .collect();
        assert_eq!(uuids, vec!["vm-a".to_string(), "vm-c".to_string()]);
    }

    #[tokio::test]
    async fn host_rejection_stops_the_pass() {
        let hv = Arc::new(SimulatedHypervisor::new("compute-1", 1, 4).with_domain("vm-a", 1, 1));
        let conductor = Arc::new(RecordingConductor {
            reject_hosts: true,
            ..Default::default()
        });
        let err = tracker(hv, conductor.clone()).report_once().await.unwrap_err();
        assert!(matches!(err, TrackerError::Conductor(_)));
        assert!(conductor.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_reports_immediately_then_stops() {
        let hv = Arc::new(SimulatedHypervisor::new("compute-1", 1, 2));
        let conductor = Arc::new(RecordingConductor::default());
        let tracker = tracker(hv, conductor.clone()).with_interval(Duration::from_secs(3600));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { tracker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(conductor.hosts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_can_wait_for_first_interval() {
        let hv = Arc::new(SimulatedHypervisor::new("compute-1", 1, 2));
        let conductor = Arc::new(RecordingConductor::default());
        let tracker = tracker(hv, conductor.clone())
            .with_interval(Duration::from_secs(3600))
            .with_run_immediately(false);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { tracker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(conductor.hosts.lock().unwrap().is_empty());
    }
}
