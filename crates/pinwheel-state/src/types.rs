//! Domain types for the pinwheel state store.
//!
//! Records are plain snapshots. Writers build a new snapshot and compare it
//! with the stored one through `changed_fields`; nothing tracks dirty fields.

use std::collections::BTreeMap;
use std::fmt;

use pinwheel_core::CpuMap;
use serde::{Deserialize, Serialize};

// ── Hosts ──────────────────────────────────────────────────────

/// A compute host as last reported by its resource tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host_name: String,
    /// NUMA cell id → ordered host CPU ids.
    pub cpu_topology: BTreeMap<u32, Vec<u32>>,
    /// Logical CPU count; the width of every bitmap compiled for this host.
    pub maxcpu: u32,
    /// Where the host's pin executor accepts RPC.
    pub rpc_address: Option<String>,
    /// When the topology or address last changed. Not a liveness signal:
    /// identical reports leave it alone.
    pub updated_at: u64,
}

impl HostRecord {
    pub fn table_key(&self) -> String {
        self.host_name.clone()
    }

    /// Fields that differ from `stored`, ignoring timestamps.
    pub fn changed_fields(&self, stored: &HostRecord) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.cpu_topology != stored.cpu_topology {
            changed.push("cpu_topology");
        }
        if self.maxcpu != stored.maxcpu {
            changed.push("maxcpu");
        }
        if self.rpc_address != stored.rpc_address {
            changed.push("rpc_address");
        }
        changed
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Run state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Last,
}

impl PowerState {
    /// Map a libvirt `virDomainState` code. Codes past the table are `Last`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoState,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::Suspended,
            _ => Self::Last,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoState => "no-state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::Suspended => "suspended",
            Self::Last => "last",
        };
        f.write_str(s)
    }
}

/// Observed state of one instance on its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uuid: String,
    pub host: Option<String>,
    pub status: PowerState,
    /// vCPU index → the host CPUs that vCPU may run on.
    pub cpu_mappings: BTreeMap<u32, CpuMap>,
    /// When host, status, or affinity last changed.
    pub updated_at: u64,
}

impl InstanceRecord {
    pub fn table_key(&self) -> String {
        self.uuid.clone()
    }

    /// Fields that differ from `stored`, ignoring timestamps.
    pub fn changed_fields(&self, stored: &InstanceRecord) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.host != stored.host {
            changed.push("host");
        }
        if self.status != stored.status {
            changed.push("status");
        }
        if self.cpu_mappings != stored.cpu_mappings {
            changed.push("cpu_mappings");
        }
        changed
    }
}

// ── CPU mappings ───────────────────────────────────────────────

/// Lifecycle of a mapping. `Pending` is only ever the initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MappingStatus {
    Pending,
    Succeed,
    Failed,
}

impl MappingStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Terminal statuses never go back to `Pending`; a new apply cycle may
    /// replace one terminal status with another.
    pub fn can_transition_to(self, next: MappingStatus) -> bool {
        next.is_terminal() || self == Self::Pending
    }

    pub fn from_applied(applied: bool) -> Self {
        if applied { Self::Succeed } else { Self::Failed }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Succeed => "SUCCEED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Desired CPU placement for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub id: u64,
    pub instance_uuid: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub host: Option<String>,
    /// Range specification, compiled on the owning host at apply time.
    pub cpu_mappings: String,
    pub status: MappingStatus,
    /// Why the last apply failed. Cleared on success.
    #[serde(default)]
    pub status_reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl MappingRecord {
    pub fn table_key(&self) -> String {
        self.instance_uuid.clone()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// The record after an apply cycle finished.
    pub fn settled(mut self, applied: bool, reason: Option<String>) -> Self {
        self.status = MappingStatus::from_applied(applied);
        self.status_reason = if applied { None } else { reason };
        self
    }
}

/// Fields supplied when creating a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMapping {
    pub instance_uuid: String,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    pub host: Option<String>,
    pub cpu_mappings: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_state_table() {
        assert_eq!(PowerState::from_code(0), PowerState::NoState);
        assert_eq!(PowerState::from_code(1), PowerState::Running);
        assert_eq!(PowerState::from_code(5), PowerState::Shutoff);
        assert_eq!(PowerState::from_code(7), PowerState::Suspended);
        assert_eq!(PowerState::from_code(8), PowerState::Last);
        assert_eq!(PowerState::from_code(42), PowerState::Last);
    }

    #[test]
    fn power_state_serializes_kebab() {
        let json = serde_json::to_string(&PowerState::NoState).unwrap();
        assert_eq!(json, "\"no-state\"");
        assert_eq!(PowerState::NoState.to_string(), "no-state");
    }

    #[test]
    fn status_is_one_way() {
        use MappingStatus::*;
        assert!(Pending.can_transition_to(Succeed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Succeed));
        assert!(Succeed.can_transition_to(Failed));
        assert!(!Succeed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&MappingStatus::Succeed).unwrap();
        assert_eq!(json, "\"SUCCEED\"");
    }

    #[test]
    fn host_diff_ignores_timestamp() {
        let a = HostRecord {
            host_name: "h1".into(),
            cpu_topology: BTreeMap::from([(0, vec![0, 1])]),
            maxcpu: 2,
            rpc_address: None,
            updated_at: 1,
        };
        let mut b = a.clone();
        b.updated_at = 99;
        assert!(b.changed_fields(&a).is_empty());

        b.maxcpu = 4;
        b.cpu_topology.insert(1, vec![2, 3]);
        assert_eq!(b.changed_fields(&a), vec!["cpu_topology", "maxcpu"]);
    }

    #[test]
    fn instance_record_round_trips_cpu_mappings() {
        let record = InstanceRecord {
            uuid: "vm-1".into(),
            host: Some("h1".into()),
            status: PowerState::Running,
            cpu_mappings: BTreeMap::from([(0, CpuMap::from(vec![true, false]))]),
            updated_at: 0,
        };
        let json = serde_json::to_vec(&record).unwrap();
        let back: InstanceRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn settled_clears_reason_on_success() {
        let record = MappingRecord {
            id: 1,
            instance_uuid: "vm-1".into(),
            project_id: None,
            user_id: None,
            host: None,
            cpu_mappings: "0-1".into(),
            status: MappingStatus::Failed,
            status_reason: Some("timeout".into()),
            created_at: 0,
            updated_at: 0,
        };
        let ok = record.clone().settled(true, Some("ignored".into()));
        assert_eq!(ok.status, MappingStatus::Succeed);
        assert!(ok.status_reason.is_none());

        let failed = record.settled(false, Some("vcpu 1 rejected".into()));
        assert_eq!(failed.status, MappingStatus::Failed);
        assert_eq!(failed.status_reason.as_deref(), Some("vcpu 1 rejected"));
    }
}
