//! Agent error types.

use pinwheel_core::CpuSpecError;
use pinwheel_hypervisor::HypervisorError;
use pinwheel_rpc::{FaultKind, RpcError, RpcFault};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    InvalidCpuSpecification(#[from] CpuSpecError),

    #[error("hypervisor call failed: {0}")]
    Hypervisor(#[from] HypervisorError),
}

impl ExecutorError {
    pub fn to_fault(&self) -> RpcFault {
        match self {
            Self::InvalidCpuSpecification(spec) => RpcFault::from(spec.clone()),
            Self::Hypervisor(HypervisorError::DomainNotFound(uuid)) => {
                RpcFault::new(FaultKind::InstanceNotFound, format!("no domain {uuid} on this host"))
            }
            Self::Hypervisor(e) => RpcFault::new(FaultKind::HypervisorCallFailed, e.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("hypervisor: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("conductor: {0}")]
    Conductor(#[from] RpcError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("conductor: {0}")]
    Conductor(#[from] RpcError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
