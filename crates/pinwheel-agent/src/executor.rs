//! PinExecutor — applies a CPU range specification to a live domain.
//!
//! # Apply
//!
//! 1. Read the domain's live vCPU count
//! 2. Compile the spec against the host's CPU count (a bad spec stops here,
//!    before any pin call)
//! 3. Pin vCPUs `0..n` to the same bitmap, one call each
//! 4. Report every per-vCPU result; the mapping applied only if all succeeded
//!
//! A failed vCPU is logged and the loop moves on. Applies to the same
//! instance run one at a time.

use std::sync::Arc;

use pinwheel_core::{KeyedLocks, compile};
use pinwheel_hypervisor::{Hypervisor, HypervisorResult};
use tracing::{debug, info, warn};

use crate::error::ExecutorError;

/// Per-vCPU results of one apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinOutcome {
    pub vcpu_results: Vec<bool>,
}

impl PinOutcome {
    /// True when every vCPU was pinned.
    pub fn applied(&self) -> bool {
        self.vcpu_results.iter().all(|ok| *ok)
    }

    pub fn failed_vcpus(&self) -> Vec<u32> {
        self.vcpu_results
            .iter()
            .enumerate()
            .filter_map(|(i, ok)| (!ok).then_some(i as u32))
            .collect()
    }
}

pub struct PinExecutor {
    hypervisor: Arc<dyn Hypervisor>,
    maxcpu: usize,
    locks: KeyedLocks,
}

impl PinExecutor {
    /// Build an executor, reading the host CPU count once.
    pub async fn new(hypervisor: Arc<dyn Hypervisor>) -> HypervisorResult<Self> {
        let maxcpu = hypervisor.max_cpus().await? as usize;
        info!(backend = hypervisor.name(), maxcpu, "pin executor ready");
        Ok(Self {
            hypervisor,
            maxcpu,
            locks: KeyedLocks::new(),
        })
    }

    pub fn maxcpu(&self) -> usize {
        self.maxcpu
    }

    pub async fn apply(&self, instance_uuid: &str, spec: &str) -> Result<PinOutcome, ExecutorError> {
        let _guard = self.locks.lock(instance_uuid).await;

        let vcpus = self.hypervisor.domain_info(instance_uuid).await?.vcpus;
        let map = compile(spec, self.maxcpu)?;
        debug!(%instance_uuid, vcpus, cpulist = %map.to_cpulist(), "pinning vcpus");

        let mut vcpu_results = Vec::with_capacity(vcpus as usize);
        for vcpu in 0..vcpus {
            match self.hypervisor.pin_vcpu(instance_uuid, vcpu, &map).await {
                Ok(()) => {
                    debug!(%instance_uuid, vcpu, "vcpu pinned");
                    vcpu_results.push(true);
                }
                Err(e) => {
                    warn!(%instance_uuid, vcpu, error = %e, "vcpu pin failed");
                    vcpu_results.push(false);
                }
            }
        }

        let outcome = PinOutcome { vcpu_results };
        if outcome.applied() {
            info!(%instance_uuid, %spec, vcpus, "cpu mapping applied");
        } else {
            warn!(%instance_uuid, %spec, failed = ?outcome.failed_vcpus(), "cpu mapping partially applied");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pinwheel_core::SpecErrorReason;
    use pinwheel_hypervisor::{HypervisorError, SimulatedHypervisor};

    use super::*;

    async fn executor(hv: Arc<SimulatedHypervisor>) -> PinExecutor {
        PinExecutor::new(hv).await.unwrap()
    }

    #[tokio::test]
    async fn pins_every_vcpu() {
        let hv = Arc::new(SimulatedHypervisor::new("h", 1, 8).with_domain("vm-1", 1, 4));
        let exec = executor(hv.clone()).await;

        let outcome = exec.apply("vm-1", "2-4").await.unwrap();
        assert!(outcome.applied());
        assert_eq!(outcome.vcpu_results.len(), 4);

        for pins in hv.pins("vm-1").unwrap() {
            assert_eq!(pins.to_string(), "FFTTTFFF");
        }
    }

    #[tokio::test]
    async fn partial_failure_still_attempts_every_vcpu() {
        let hv = Arc::new(SimulatedHypervisor::new("h", 1, 8).with_domain("vm-1", 1, 4));
        hv.fail_pin("vm-1", 1);
        let exec = executor(hv.clone()).await;

        let outcome = exec.apply("vm-1", "0-3").await.unwrap();
        assert!(!outcome.applied());
        assert_eq!(outcome.vcpu_results, vec![true, false, true, true]);
        assert_eq!(outcome.failed_vcpus(), vec![1]);

        let attempted: Vec<u32> = hv.pin_log().iter().map(|a| a.vcpu).collect();
        assert_eq!(attempted, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn invalid_spec_makes_no_pin_calls() {
        let hv = Arc::new(SimulatedHypervisor::new("h", 1, 8).with_domain("vm-1", 1, 2));
        let exec = executor(hv.clone()).await;

        match exec.apply("vm-1", "9").await {
            Err(ExecutorError::InvalidCpuSpecification(e)) => {
                assert_eq!(e.reason, SpecErrorReason::OutOfRange)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(hv.pin_log().is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_is_hypervisor_error() {
        let hv = Arc::new(SimulatedHypervisor::new("h", 1, 8));
        let exec = executor(hv).await;
        assert!(matches!(
            exec.apply("ghost", "0").await,
            Err(ExecutorError::Hypervisor(HypervisorError::DomainNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn same_instance_applies_do_not_interleave() {
        let hv = Arc::new(
            SimulatedHypervisor::new("h", 1, 4)
                .with_domain("vm-1", 1, 3)
                .with_pin_delay(Duration::from_millis(5)),
        );
        let exec = Arc::new(executor(hv.clone()).await);

        let a = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.apply("vm-1", "0").await.unwrap() })
        };
        let b = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.apply("vm-1", "3").await.unwrap() })
        };
        a.await.unwrap();
        b.await.unwrap();

        // Each apply's three calls are contiguous in the log.
        let lists: Vec<String> = hv.pin_log().into_iter().map(|p| p.cpulist).collect();
        assert_eq!(lists.len(), 6);
        assert!(lists[..3].iter().all(|l| l == &lists[0]));
        assert!(lists[3..].iter().all(|l| l == &lists[3]));
        assert_ne!(lists[0], lists[3]);
    }
}
