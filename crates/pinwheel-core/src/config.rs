//! pinwheel.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Metadata key that marks an instance for pinning when absent from config.
pub const DEFAULT_TRIGGER_METADATA_KEY: &str = "vcpu-pinning";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PinwheelConfig {
    /// Local host name. Falls back to the hypervisor's hostname.
    pub host: Option<String>,
    pub conductor: ConductorConfig,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    /// Bound on each store → executor apply call.
    pub rpc_timeout: String,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7420".to_string(),
            data_dir: PathBuf::from("/var/lib/pinwheel"),
            rpc_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Route trigger events through the conductor so status is recorded.
    #[default]
    Conductor,
    /// Apply locally without touching mapping status.
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    #[default]
    Virsh,
    /// In-memory hypervisor, for development and tests.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen: String,
    /// Address the conductor should use to reach this agent.
    pub advertise: Option<String>,
    pub conductor_addr: String,
    pub tracker_interval: String,
    pub tracker_run_immediately: bool,
    pub trigger_metadata_key: String,
    pub dispatch_mode: DispatchMode,
    pub hypervisor: HypervisorKind,
    pub virsh_uri: String,
    /// Bound on each `virsh` invocation.
    pub virsh_timeout: String,
    pub notification_queue: usize,
    /// Timeout for agent → conductor calls.
    pub rpc_timeout: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7421".to_string(),
            advertise: None,
            conductor_addr: "127.0.0.1:7420".to_string(),
            tracker_interval: "60s".to_string(),
            tracker_run_immediately: true,
            trigger_metadata_key: DEFAULT_TRIGGER_METADATA_KEY.to_string(),
            dispatch_mode: DispatchMode::Conductor,
            hypervisor: HypervisorKind::Virsh,
            virsh_uri: "qemu:///system".to_string(),
            virsh_timeout: "10s".to_string(),
            notification_queue: 256,
            rpc_timeout: "30s".to_string(),
        }
    }
}

impl AgentConfig {
    /// The advertised RPC address, defaulting to the listen address.
    pub fn advertise_addr(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.listen)
    }

    /// True when the conductor would be handed a wildcard address such as
    /// `0.0.0.0:7421`, which it cannot dial.
    pub fn advertises_wildcard(&self) -> bool {
        let addr = self.advertise_addr();
        let host = match addr.rsplit_once(':') {
            Some((host, _)) => host,
            None => addr,
        };
        matches!(host, "0.0.0.0" | "[::]" | "::" | "")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared token required on every RPC. `None` leaves RPC open.
    pub rpc_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl PinwheelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PinwheelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conductor_rpc_timeout()?;
        self.agent_rpc_timeout()?;
        self.tracker_interval()?;
        self.virsh_timeout()?;
        if self.agent.trigger_metadata_key.trim().is_empty() {
            return Err(ConfigError::Empty("agent.trigger_metadata_key"));
        }
        Ok(())
    }

    pub fn conductor_rpc_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("conductor.rpc_timeout", &self.conductor.rpc_timeout)
    }

    pub fn agent_rpc_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("agent.rpc_timeout", &self.agent.rpc_timeout)
    }

    pub fn tracker_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("agent.tracker_interval", &self.agent.tracker_interval)
    }

    pub fn virsh_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("agent.virsh_timeout", &self.agent.virsh_timeout)
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::Duration {
            field,
            value: value.to_string(),
        }),
    }
}

/// Parse `"500ms"`, `"5s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
