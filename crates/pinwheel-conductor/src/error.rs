//! Conductor error types.

use pinwheel_core::CpuSpecError;
use pinwheel_rpc::{FaultKind, RpcError, RpcFault};
use pinwheel_state::StateError;
use thiserror::Error;

pub type ConductorResult<T> = Result<T, ConductorError>;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error(transparent)]
    InvalidCpuSpecification(#[from] CpuSpecError),

    #[error("no cpu mapping for instance {0}")]
    MappingNotFound(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {uuid} is not active (status {status})")]
    InstanceNotActive { uuid: String, status: String },

    #[error("cpu mapping already exists for instance {0}")]
    MappingAlreadyExists(String),

    #[error("hypervisor call failed: {0}")]
    HypervisorCallFailed(String),

    #[error("rpc timed out: {0}")]
    RpcTimeout(String),

    #[error("unauthorized request")]
    Unauthorized,

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl From<RpcError> for ConductorError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout { .. } => Self::RpcTimeout(e.to_string()),
            RpcError::Remote(fault) => match (fault.kind, fault.spec_error) {
                (FaultKind::InvalidCpuSpecification, Some(spec)) => Self::InvalidCpuSpecification(spec),
                (FaultKind::HypervisorCallFailed, _) => Self::HypervisorCallFailed(fault.message),
                (FaultKind::UnauthorizedRequest, _) => Self::Unauthorized,
                (FaultKind::RpcTimeout, _) => Self::RpcTimeout(fault.message),
                (kind, _) => Self::Rpc(format!("{kind:?}: {}", fault.message)),
            },
            other => Self::Rpc(other.to_string()),
        }
    }
}

impl ConductorError {
    /// Wire representation of this error.
    pub fn to_fault(&self) -> RpcFault {
        let kind = match self {
            Self::InvalidCpuSpecification(spec) => return RpcFault::from(spec.clone()),
            Self::MappingNotFound(_) => FaultKind::MappingNotFound,
            Self::HostNotFound(_) => FaultKind::HostNotFound,
            Self::InstanceNotFound(_) => FaultKind::InstanceNotFound,
            Self::InstanceNotActive { .. } => FaultKind::InstanceNotActive,
            Self::MappingAlreadyExists(_) => FaultKind::MappingAlreadyExists,
            Self::HypervisorCallFailed(_) => FaultKind::HypervisorCallFailed,
            Self::RpcTimeout(_) => FaultKind::RpcTimeout,
            Self::Unauthorized => FaultKind::UnauthorizedRequest,
            Self::Rpc(_) | Self::State(_) => FaultKind::Internal,
        };
        RpcFault::new(kind, self.to_string())
    }
}
