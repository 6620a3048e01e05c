//! Message types and routes.

use std::fmt;

use pinwheel_core::{CpuSpecError, RequestContext};
use pinwheel_state::{HostRecord, InstanceRecord, MappingRecord};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build. Requests with any other version
/// are refused.
pub const RPC_API_VERSION: &str = "1.0";

/// Header carrying the shared RPC token.
pub const TOKEN_HEADER: &str = "x-pinwheel-token";

pub mod routes {
    // Conductor
    pub const CREATE_MAPPING: &str = "/rpc/v1/create_instance_cpu_mapping";
    pub const RECONCILE_INSTANCE: &str = "/rpc/v1/reconcile_instance";
    pub const RECONCILE_HOST: &str = "/rpc/v1/reconcile_host";
    pub const RECONCILE_INSTANCES: &str = "/rpc/v1/reconcile_instances";
    pub const REAPPLY_MAPPING: &str = "/rpc/v1/reapply_instance_cpu_mapping";

    // Agent
    pub const APPLY_MAPPING: &str = "/rpc/v1/apply_instance_cpu_mapping";
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest<T> {
    pub version: String,
    pub context: RequestContext,
    pub payload: T,
}

impl<T> RpcRequest<T> {
    pub fn new(context: RequestContext, payload: T) -> Self {
        Self {
            version: RPC_API_VERSION.to_string(),
            context,
            payload,
        }
    }
}

/// Reply envelope: `{"ok": ...}` or `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcReply<T> {
    Ok(T),
    Error(RpcFault),
}

/// Error kinds that cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    InvalidCpuSpecification,
    MappingNotFound,
    HostNotFound,
    InstanceNotFound,
    InstanceNotActive,
    MappingAlreadyExists,
    HypervisorCallFailed,
    RpcTimeout,
    UnauthorizedRequest,
    VersionMismatch,
    BadRequest,
    Internal,
}

impl FaultKind {
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidCpuSpecification | Self::BadRequest | Self::VersionMismatch => 400,
            Self::UnauthorizedRequest => 401,
            Self::MappingNotFound | Self::HostNotFound | Self::InstanceNotFound => 404,
            Self::MappingAlreadyExists | Self::InstanceNotActive => 409,
            Self::HypervisorCallFailed => 502,
            Self::RpcTimeout => 504,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: FaultKind,
    pub message: String,
    /// Set for `InvalidCpuSpecification`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_error: Option<CpuSpecError>,
}

impl RpcFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            spec_error: None,
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(FaultKind::UnauthorizedRequest, "missing or invalid rpc token")
    }
}

impl From<CpuSpecError> for RpcFault {
    fn from(e: CpuSpecError) -> Self {
        Self {
            kind: FaultKind::InvalidCpuSpecification,
            message: e.to_string(),
            spec_error: Some(e),
        }
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ── Conductor payloads ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMappingRequest {
    pub instance_uuid: String,
    pub cpu_mappings: String,
    /// `false` means the instance is already placed and should be pinned now.
    #[serde(default)]
    pub wait_until_active: bool,
    /// Host the caller knows the instance is on. Looked up when absent.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileInstanceRequest {
    pub instance_uuid: String,
    pub host: String,
}

/// `None` when the instance has no mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileInstanceReply {
    pub mapping: Option<MappingRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileHostRequest {
    pub host: HostRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileHostReply {
    pub created: bool,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileInstancesRequest {
    pub host_name: String,
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapplyMappingRequest {
    pub instance_uuid: String,
}

// ── Agent payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyMappingRequest {
    pub mapping: MappingRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyMappingReply {
    /// AND of every per-vCPU result.
    pub applied: bool,
    /// Per-vCPU outcome, indexed by vCPU.
    pub vcpu_results: Vec<bool>,
}

#[cfg(test)]
mod tests {
    use pinwheel_core::compile;

    use super::*;

    #[test]
    fn reply_envelope_shape() {
        let ok: RpcReply<ApplyMappingReply> = RpcReply::Ok(ApplyMappingReply {
            applied: true,
            vcpu_results: vec![true, true],
        });
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["ok"]["applied"], true);

        let err: RpcReply<ApplyMappingReply> =
            RpcReply::Error(RpcFault::new(FaultKind::HostNotFound, "compute-9"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["kind"], "host_not_found");
        assert!(json["error"].get("spec_error").is_none());
    }

    #[test]
    fn spec_error_carried_in_fault() {
        let fault = RpcFault::from(compile("5-2", 8).unwrap_err());
        assert_eq!(fault.kind, FaultKind::InvalidCpuSpecification);
        let json = serde_json::to_string(&fault).unwrap();
        let back: RpcFault = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fault);
    }

    #[test]
    fn request_carries_version() {
        let req = RpcRequest::new(
            RequestContext::service("test"),
            ReapplyMappingRequest {
                instance_uuid: "vm-1".into(),
            },
        );
        assert_eq!(req.version, RPC_API_VERSION);
    }

    #[test]
    fn create_request_defaults() {
        let req: CreateMappingRequest =
            serde_json::from_str(r#"{"instance_uuid":"vm-1","cpu_mappings":"0-1"}"#).unwrap();
        assert!(!req.wait_until_active);
        assert!(req.host.is_none());
    }

    #[test]
    fn status_codes() {
        assert_eq!(FaultKind::UnauthorizedRequest.http_status(), 401);
        assert_eq!(FaultKind::MappingAlreadyExists.http_status(), 409);
        assert_eq!(FaultKind::InvalidCpuSpecification.http_status(), 400);
    }
}
