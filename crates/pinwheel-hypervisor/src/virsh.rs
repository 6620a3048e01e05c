//! libvirt access through the `virsh` command line.
//!
//! Every call spawns `virsh -c <uri> ...` and parses its text output. The
//! parsers are plain functions so they can be tested against captured output.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pinwheel_core::{CpuMap, compile};
use tokio::process::Command;
use tracing::debug;

use crate::error::{HypervisorError, HypervisorResult};
use crate::{DomainInfo, Hypervisor, NumaTopology};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Hypervisor backend that shells out to `virsh`.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    binary: PathBuf,
    uri: String,
    command_timeout: Duration,
}

impl VirshHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("virsh"),
            uri: uri.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> HypervisorResult<String> {
        let command = format!("virsh {}", args.join(" "));
        debug!(%command, uri = %self.uri, "running virsh");

        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(&self.binary)
                .arg("-c")
                .arg(&self.uri)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| HypervisorError::Command {
            command: command.clone(),
            detail: format!("timed out after {:?}", self.command_timeout),
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(HypervisorError::Command {
                command,
                detail: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like `run`, but reports a missing domain as `DomainNotFound`.
    async fn run_for_domain(&self, uuid: &str, args: &[&str]) -> HypervisorResult<String> {
        self.run(args).await.map_err(|e| match e {
            HypervisorError::Command { ref detail, .. } if is_missing_domain(detail) => {
                HypervisorError::DomainNotFound(uuid.to_string())
            }
            other => other,
        })
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    fn name(&self) -> &'static str {
        "virsh"
    }

    async fn hostname(&self) -> HypervisorResult<String> {
        let out = self.run(&["hostname"]).await?;
        let name = out.trim();
        if name.is_empty() {
            return Err(HypervisorError::Parse {
                what: "hostname",
                detail: "empty".to_string(),
            });
        }
        Ok(name.to_string())
    }

    async fn max_cpus(&self) -> HypervisorResult<u32> {
        let out = self.run(&["nodeinfo"]).await?;
        parse_nodeinfo_cpus(&out)
    }

    async fn numa_topology(&self) -> HypervisorResult<NumaTopology> {
        let out = self.run(&["capabilities"]).await?;
        Ok(parse_capabilities_topology(&out))
    }

    async fn active_domains(&self) -> HypervisorResult<Vec<String>> {
        let out = self.run(&["list", "--uuid"]).await?;
        Ok(parse_uuid_list(&out))
    }

    async fn domain_info(&self, uuid: &str) -> HypervisorResult<DomainInfo> {
        let out = self.run_for_domain(uuid, &["dominfo", uuid]).await?;
        let (state_code, vcpus) = parse_dominfo(&out)?;
        Ok(DomainInfo {
            uuid: uuid.to_string(),
            state_code,
            vcpus,
        })
    }

    async fn vcpu_pin_info(&self, uuid: &str) -> HypervisorResult<Vec<CpuMap>> {
        let maxcpu = self.max_cpus().await?;
        let out = self.run_for_domain(uuid, &["vcpupin", uuid]).await?;
        parse_vcpupin(&out, maxcpu as usize)
    }

    async fn pin_vcpu(&self, uuid: &str, vcpu: u32, map: &CpuMap) -> HypervisorResult<()> {
        let cpulist = map.to_cpulist();
        if cpulist.is_empty() {
            return Err(HypervisorError::Rejected(format!(
                "empty cpu list for vcpu {vcpu} of {uuid}"
            )));
        }
        let vcpu = vcpu.to_string();
        self.run_for_domain(
            uuid,
            &["vcpupin", uuid, "--vcpu", &vcpu, "--cpulist", &cpulist, "--live"],
        )
        .await?;
        Ok(())
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("Domain not found") || stderr.contains("failed to get domain")
}

/// `Label:   value` lookup in key/value style output.
fn field<'a>(out: &'a str, label: &str) -> Option<&'a str> {
    out.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == label).then(|| value.trim())
    })
}

/// Logical CPU count from `virsh nodeinfo`.
pub fn parse_nodeinfo_cpus(out: &str) -> HypervisorResult<u32> {
    field(out, "CPU(s)")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HypervisorError::Parse {
            what: "nodeinfo",
            detail: "missing CPU(s) line".to_string(),
        })
}

/// One UUID per non-blank line, as printed by `virsh list --uuid`.
pub fn parse_uuid_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Map `virsh` state text to a `virDomainState` code.
pub fn state_code_from_text(state: &str) -> u8 {
    match state.trim() {
        "no state" => 0,
        "running" => 1,
        "idle" | "blocked" => 2,
        "paused" => 3,
        "in shutdown" => 4,
        "shut off" => 5,
        "crashed" => 6,
        "pmsuspended" => 7,
        _ => 8,
    }
}

/// `(state code, vcpu count)` from `virsh dominfo`.
pub fn parse_dominfo(out: &str) -> HypervisorResult<(u8, u32)> {
    let state = field(out, "State").ok_or_else(|| HypervisorError::Parse {
        what: "dominfo",
        detail: "missing State line".to_string(),
    })?;
    let vcpus = field(out, "CPU(s)")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| HypervisorError::Parse {
            what: "dominfo",
            detail: "missing CPU(s) line".to_string(),
        })?;
    Ok((state_code_from_text(state), vcpus))
}

/// Value of `name='…'` or `name="…"` inside an XML start tag.
fn xml_attr<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    for quote in ['\'', '"'] {
        let needle = format!(" {name}={quote}");
        if let Some(start) = tag.find(&needle) {
            let rest = &tag[start + needle.len()..];
            return rest.find(quote).map(|end| &rest[..end]);
        }
    }
    None
}

/// NUMA cells from `virsh capabilities`.
///
/// Reads `<cell id=..>` elements under `<topology>` and the `<cpu id=..>`
/// children of each. The host `<cpu>` block has no `id`, and `<sibling>`
/// distance entries are a different tag, so neither is picked up.
pub fn parse_capabilities_topology(xml: &str) -> NumaTopology {
    let mut topology = NumaTopology::new();
    let mut cell: Option<u32> = None;
    for line in xml.lines().map(str::trim) {
        if line.starts_with("<cell ") {
            cell = xml_attr(line, "id").and_then(|id| id.parse().ok());
            if let Some(id) = cell {
                topology.entry(id).or_default();
            }
        } else if line.starts_with("</cell>") {
            cell = None;
        } else if line.starts_with("<cpu ") {
            if let (Some(id), Some(cpu)) = (cell, xml_attr(line, "id").and_then(|c| c.parse().ok())) {
                topology.entry(id).or_default().push(cpu);
            }
        }
    }
    for cpus in topology.values_mut() {
        cpus.sort_unstable();
    }
    topology
}

/// Per-vCPU affinity from `virsh vcpupin <domain>`.
///
/// Accepts both the tabular layout (`0      0-3`) and the older
/// `0: 0-3` layout. Rows come back ordered by vCPU index.
pub fn parse_vcpupin(out: &str, maxcpu: usize) -> HypervisorResult<Vec<CpuMap>> {
    let mut rows: Vec<(u32, CpuMap)> = Vec::new();
    for line in out.lines().map(str::trim) {
        let (vcpu, affinity) = match line.split_once(':') {
            Some((v, a)) => (v.trim(), a.trim()),
            None => match line.split_once(char::is_whitespace) {
                Some((v, a)) => (v.trim(), a.trim()),
                None => continue,
            },
        };
        let Ok(vcpu) = vcpu.parse::<u32>() else {
            continue;
        };
        let map = compile(affinity, maxcpu).map_err(|e| HypervisorError::Parse {
            what: "vcpupin",
            detail: format!("vcpu {vcpu}: {e}"),
        })?;
        rows.push((vcpu, map));
    }
    rows.sort_by_key(|(vcpu, _)| *vcpu);
    Ok(rows.into_iter().map(|(_, map)| map).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODEINFO: &str = "\
CPU model:           x86_64
CPU(s):              8
CPU frequency:       2400 MHz
CPU socket(s):       1
Core(s) per socket:  4
Thread(s) per core:  2
NUMA cell(s):        2
Memory size:         32768000 KiB
";

    const CAPABILITIES: &str = r#"<capabilities>
  <host>
    <uuid>4c4c4544-0042-3510-8052-b7c04f4e4d32</uuid>
    <cpu>
      <arch>x86_64</arch>
      <topology sockets='1' dies='1' cores='4' threads='2'/>
    </cpu>
    <topology>
      <cells num='2'>
        <cell id='0'>
          <memory unit='KiB'>16384000</memory>
          <distances>
            <sibling id='0' value='10'/>
            <sibling id='1' value='21'/>
          </distances>
          <cpus num='4'>
            <cpu id='0' socket_id='0' die_id='0' core_id='0' siblings='0,4'/>
            <cpu id='4' socket_id='0' die_id='0' core_id='0' siblings='0,4'/>
            <cpu id='1' socket_id='0' die_id='0' core_id='1' siblings='1,5'/>
            <cpu id='5' socket_id='0' die_id='0' core_id='1' siblings='1,5'/>
          </cpus>
        </cell>
        <cell id="1">
          <cpus num='4'>
            <cpu id="2" socket_id='0' core_id='2' siblings='2,6'/>
            <cpu id="6" socket_id='0' core_id='2' siblings='2,6'/>
            <cpu id="3" socket_id='0' core_id='3' siblings='3,7'/>
            <cpu id="7" socket_id='0' core_id='3' siblings='3,7'/>
          </cpus>
        </cell>
      </cells>
    </topology>
  </host>
</capabilities>
"#;

    #[test]
    fn nodeinfo_cpu_count() {
        assert_eq!(parse_nodeinfo_cpus(NODEINFO).unwrap(), 8);
        assert!(parse_nodeinfo_cpus("garbage").is_err());
    }

    #[test]
    fn capabilities_cells() {
        let topology = parse_capabilities_topology(CAPABILITIES);
        assert_eq!(topology.len(), 2);
        assert_eq!(topology[&0], vec![0, 1, 4, 5]);
        assert_eq!(topology[&1], vec![2, 3, 6, 7]);
    }

    #[test]
    fn uuid_list_skips_blank_lines() {
        let out = "3c9f0a1e-1111-4a2b-9c3d-000000000001\n\n3c9f0a1e-1111-4a2b-9c3d-000000000002\n\n";
        assert_eq!(parse_uuid_list(out).len(), 2);
    }

    #[test]
    fn dominfo_state_and_vcpus() {
        let out = "\
Id:             3
Name:           web-01
UUID:           3c9f0a1e-1111-4a2b-9c3d-000000000001
OS Type:        hvm
State:          running
CPU(s):         4
CPU time:       12.3s
";
        assert_eq!(parse_dominfo(out).unwrap(), (1, 4));

        let off = out.replace("running", "shut off");
        assert_eq!(parse_dominfo(&off).unwrap(), (5, 4));
    }

    #[test]
    fn state_text_table() {
        assert_eq!(state_code_from_text("no state"), 0);
        assert_eq!(state_code_from_text("idle"), 2);
        assert_eq!(state_code_from_text("in shutdown"), 4);
        assert_eq!(state_code_from_text("pmsuspended"), 7);
        assert_eq!(state_code_from_text("martian"), 8);
    }

    #[test]
    fn vcpupin_tabular_layout() {
        let out = "\
 VCPU   CPU Affinity
----------------------
 0      0-3
 1      2
 2      4-7
";
        let maps = parse_vcpupin(out, 8).unwrap();
        assert_eq!(maps.len(), 3);
        assert_eq!(maps[0].to_cpulist(), "0-3");
        assert_eq!(maps[1].to_cpulist(), "2");
        assert_eq!(maps[2].to_cpulist(), "4-7");
    }

    #[test]
    fn vcpupin_colon_layout() {
        let out = "\
VCPU: CPU Affinity
----------------------------------
   1: 0,2
   0: 0-7
";
        let maps = parse_vcpupin(out, 8).unwrap();
        assert_eq!(maps[0], CpuMap::full(8));
        assert_eq!(maps[1].to_cpulist(), "0,2");
    }

    #[test]
    fn vcpupin_affinity_wider_than_host_is_an_error() {
        let out = " 0      0-15\n";
        assert!(matches!(
            parse_vcpupin(out, 8),
            Err(HypervisorError::Parse { what: "vcpupin", .. })
        ));
    }

    #[test]
    fn missing_domain_detection() {
        assert!(is_missing_domain(
            "error: failed to get domain 'abc'\nerror: Domain not found"
        ));
        assert!(!is_missing_domain("error: Requested operation is not valid"));
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let hv = VirshHypervisor::new("qemu:///system")
            .with_binary("/nonexistent/virsh-binary");
        assert!(matches!(
            hv.max_cpus().await,
            Err(HypervisorError::Io(_))
        ));
    }
}
