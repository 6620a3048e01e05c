//! In-memory hypervisor.
//!
//! Holds a fixed host topology and a set of domains whose vCPU affinity is
//! updated by `pin_vcpu`. Failures can be injected per domain or per vCPU,
//! and every pin attempt is recorded for inspection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pinwheel_core::CpuMap;

use crate::error::{HypervisorError, HypervisorResult};
use crate::{DomainInfo, Hypervisor, NumaTopology};

#[derive(Debug, Clone)]
struct SimDomain {
    state_code: u8,
    pins: Vec<CpuMap>,
}

#[derive(Debug, Default)]
struct SimState {
    domains: BTreeMap<String, SimDomain>,
    failing_pins: HashSet<(String, u32)>,
    failing_info: HashSet<String>,
    pin_log: Vec<PinAttempt>,
}

/// One recorded `pin_vcpu` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinAttempt {
    pub uuid: String,
    pub vcpu: u32,
    pub cpulist: String,
    pub succeeded: bool,
}

pub struct SimulatedHypervisor {
    hostname: String,
    topology: NumaTopology,
    maxcpu: u32,
    pin_delay: Duration,
    state: Mutex<SimState>,
}

impl SimulatedHypervisor {
    /// A host with `cells` NUMA cells of `cpus_per_cell` CPUs each, numbered
    /// contiguously per cell.
    pub fn new(hostname: impl Into<String>, cells: u32, cpus_per_cell: u32) -> Self {
        let topology: NumaTopology = (0..cells)
            .map(|cell| {
                let first = cell * cpus_per_cell;
                (cell, (first..first + cpus_per_cell).collect())
            })
            .collect();
        Self {
            hostname: hostname.into(),
            maxcpu: cells * cpus_per_cell,
            topology,
            pin_delay: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Add a domain in the given state code with every vCPU unpinned.
    pub fn with_domain(self, uuid: &str, state_code: u8, vcpus: u32) -> Self {
        self.add_domain(uuid, state_code, vcpus);
        self
    }

    /// Sleep this long inside every `pin_vcpu` call.
    pub fn with_pin_delay(mut self, delay: Duration) -> Self {
        self.pin_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_domain(&self, uuid: &str, state_code: u8, vcpus: u32) {
        let full = CpuMap::full(self.maxcpu as usize);
        self.lock().domains.insert(
            uuid.to_string(),
            SimDomain {
                state_code,
                pins: vec![full; vcpus as usize],
            },
        );
    }

    /// Make `pin_vcpu(uuid, vcpu, ..)` fail until cleared.
    pub fn fail_pin(&self, uuid: &str, vcpu: u32) {
        self.lock().failing_pins.insert((uuid.to_string(), vcpu));
    }

    /// Make `domain_info` and `vcpu_pin_info` fail for `uuid`.
    pub fn fail_domain_info(&self, uuid: &str) {
        self.lock().failing_info.insert(uuid.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_pins.clear();
        state.failing_info.clear();
    }

    pub fn pin_log(&self) -> Vec<PinAttempt> {
        self.lock().pin_log.clone()
    }

    /// Current affinity of every vCPU of `uuid`.
    pub fn pins(&self, uuid: &str) -> Option<Vec<CpuMap>> {
        self.lock().domains.get(uuid).map(|d| d.pins.clone())
    }

    fn domain(&self, uuid: &str) -> HypervisorResult<SimDomain> {
        let state = self.lock();
        if state.failing_info.contains(uuid) {
            return Err(HypervisorError::Rejected(format!("injected failure for {uuid}")));
        }
        state
            .domains
            .get(uuid)
            .cloned()
            .ok_or_else(|| HypervisorError::DomainNotFound(uuid.to_string()))
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn hostname(&self) -> HypervisorResult<String> {
        Ok(self.hostname.clone())
    }

    async fn max_cpus(&self) -> HypervisorResult<u32> {
        Ok(self.maxcpu)
    }

    async fn numa_topology(&self) -> HypervisorResult<NumaTopology> {
        Ok(self.topology.clone())
    }

    async fn active_domains(&self) -> HypervisorResult<Vec<String>> {
        Ok(self
            .lock()
            .domains
            .iter()
            .filter(|(_, d)| d.state_code == 1)
            .map(|(uuid, _)| uuid.clone())
            .collect())
    }

    async fn domain_info(&self, uuid: &str) -> HypervisorResult<DomainInfo> {
        let domain = self.domain(uuid)?;
        Ok(DomainInfo {
            uuid: uuid.to_string(),
            state_code: domain.state_code,
            vcpus: domain.pins.len() as u32,
        })
    }

    async fn vcpu_pin_info(&self, uuid: &str) -> HypervisorResult<Vec<CpuMap>> {
        Ok(self.domain(uuid)?.pins)
    }

    async fn pin_vcpu(&self, uuid: &str, vcpu: u32, map: &CpuMap) -> HypervisorResult<()> {
        if !self.pin_delay.is_zero() {
            tokio::time::sleep(self.pin_delay).await;
        }

        let mut state = self.lock();
        let injected = state.failing_pins.contains(&(uuid.to_string(), vcpu));
        let result = if injected {
            Err(HypervisorError::Rejected(format!(
                "injected failure pinning vcpu {vcpu} of {uuid}"
            )))
        } else if map.len() != self.maxcpu as usize || map.count_selected() == 0 {
            Err(HypervisorError::Rejected(format!(
                "invalid cpumap {map} for a {} cpu host",
                self.maxcpu
            )))
        } else {
            match state.domains.get_mut(uuid) {
                None => Err(HypervisorError::DomainNotFound(uuid.to_string())),
                Some(domain) if domain.state_code != 1 => Err(HypervisorError::Rejected(
                    format!("domain {uuid} is not running"),
                )),
                Some(domain) => match domain.pins.get_mut(vcpu as usize) {
                    Some(slot) => {
                        *slot = map.clone();
                        Ok(())
                    }
                    None => Err(HypervisorError::Rejected(format!(
                        "vcpu {vcpu} out of range for {uuid}"
                    ))),
                },
            }
        };

        state.pin_log.push(PinAttempt {
            uuid: uuid.to_string(),
            vcpu,
            cpulist: map.to_cpulist(),
            succeeded: result.is_ok(),
        });
        result
    }
}
