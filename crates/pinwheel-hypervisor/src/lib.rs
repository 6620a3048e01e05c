//! pinwheel-hypervisor — the narrow slice of hypervisor access pinwheel needs.
//!
//! Backends implement [`Hypervisor`]:
//! - [`VirshHypervisor`]: drives libvirt through the `virsh` CLI
//! - [`SimulatedHypervisor`]: in-memory domains with injectable failures

pub mod error;
pub mod simulated;
pub mod virsh;

use std::collections::BTreeMap;

use async_trait::async_trait;
use pinwheel_core::CpuMap;

pub use error::{HypervisorError, HypervisorResult};
pub use simulated::SimulatedHypervisor;
pub use virsh::VirshHypervisor;

/// NUMA cell id → ordered host CPU ids.
pub type NumaTopology = BTreeMap<u32, Vec<u32>>;

/// Point-in-time view of one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub uuid: String,
    /// libvirt `virDomainState` code (0 = no state, 1 = running, ...).
    pub state_code: u8,
    /// Live vCPU count.
    pub vcpus: u32,
}

/// Hypervisor operations used by the tracker and the pin executor.
///
/// Implementations must be safe to share across tasks; pinwheel serializes
/// pin calls per domain itself.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn hostname(&self) -> HypervisorResult<String>;

    /// Logical CPU count of the host.
    async fn max_cpus(&self) -> HypervisorResult<u32>;

    async fn numa_topology(&self) -> HypervisorResult<NumaTopology>;

    /// UUIDs of running domains.
    async fn active_domains(&self) -> HypervisorResult<Vec<String>>;

    async fn domain_info(&self, uuid: &str) -> HypervisorResult<DomainInfo>;

    /// Current affinity per vCPU, each map `max_cpus` wide.
    async fn vcpu_pin_info(&self, uuid: &str) -> HypervisorResult<Vec<CpuMap>>;

    /// Pin one vCPU of a running domain to `map`, affecting the live domain only.
    async fn pin_vcpu(&self, uuid: &str, vcpu: u32, map: &CpuMap) -> HypervisorResult<()>;
}
