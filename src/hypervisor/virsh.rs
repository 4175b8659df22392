//! Production hypervisor binding: drives libvirt through the `virsh`
//! command-line client. One invocation per operation, `-c <uri>` on every
//! call, no connection pooling.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::host::{CommandError, CommandOutput, CommandRunner};

use super::{
    AgentChannel, DhcpLease, DomainInfo, DomainState, ErrorKind, Hypervisor, HypervisorError,
    NetUpdateCommand, NetUpdateFlags,
};

pub struct VirshHypervisor {
    runner: Arc<dyn CommandRunner>,
    connection_uri: String,
}

impl VirshHypervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, connection_uri: impl Into<String>) -> Self {
        Self {
            runner,
            connection_uri: connection_uri.into(),
        }
    }

    pub fn connection_uri(&self) -> &str {
        &self.connection_uri
    }

    async fn virsh(
        &self,
        op: &'static str,
        resource: &str,
        args: &[&str],
    ) -> Result<CommandOutput, HypervisorError> {
        let mut full: Vec<&str> = vec!["-c", &self.connection_uri];
        full.extend_from_slice(args);

        let out = self
            .runner
            .run("virsh", &full)
            .await
            .map_err(|e| command_error(op, resource, e))?;

        if out.success() {
            Ok(out)
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            Err(HypervisorError::new(
                op,
                resource,
                classify_stderr(&stderr),
                stderr,
            ))
        }
    }
}

fn command_error(op: &'static str, resource: &str, err: CommandError) -> HypervisorError {
    let kind = match &err {
        CommandError::Spawn { .. } => ErrorKind::Fatal,
        _ => ErrorKind::Fatal,
    };
    HypervisorError::new(op, resource, kind, err.to_string())
}

/// Translate virsh stderr into the error taxonomy. The native messages
/// are stable enough across libvirt versions for substring matching.
pub fn classify_stderr(stderr: &str) -> ErrorKind {
    let s = stderr.to_lowercase();
    if s.contains("failed to connect") || s.contains("cannot recv data") || s.contains("connection reset") {
        ErrorKind::Transient
    } else if s.contains("domain not found") || s.contains("no domain with matching") {
        ErrorKind::NoDomain
    } else if s.contains("network not found") || s.contains("no network with matching") {
        ErrorKind::NoNetwork
    } else if s.contains("requested operation is not valid") {
        ErrorKind::OperationInvalid
    } else if s.contains("invalid argument")
        || s.contains("couldn't locate an existing dhcp host entry")
        || s.contains("there is an existing dhcp host entry")
    {
        ErrorKind::InvalidArg
    } else if s.contains("guest agent is not connected")
        || s.contains("guest agent is not responding")
        || s.contains("guest agent not available")
        || s.contains("agent is not available")
    {
        ErrorKind::AgentUnavailable
    } else {
        ErrorKind::Fatal
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn verify(&self) -> Result<(), HypervisorError> {
        let uri = self.connection_uri.clone();
        self.virsh("uri", &uri, &["uri"]).await?;
        Ok(())
    }

    async fn define_domain(&self, xml_path: &Path) -> Result<(), HypervisorError> {
        let path = xml_path.to_string_lossy();
        self.virsh("define", &path, &["define", &path]).await?;
        Ok(())
    }

    async fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError> {
        match self.domain_state(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NoDomain => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh("start", name, &["start", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh("destroy", name, &["destroy", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh("undefine", name, &["undefine", name]).await?;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let out = self.virsh("domstate", name, &["domstate", name]).await?;
        Ok(DomainState::parse(&out.stdout_string()))
    }

    async fn domain_info(&self, name: &str) -> Result<DomainInfo, HypervisorError> {
        let out = self.virsh("dominfo", name, &["dominfo", name]).await?;
        Ok(parse_dominfo(&out.stdout_string()))
    }

    async fn domain_xml(&self, name: &str) -> Result<String, HypervisorError> {
        let out = self.virsh("dumpxml", name, &["dumpxml", name]).await?;
        Ok(out.stdout_string())
    }

    async fn describe_network(&self, name: &str) -> Result<String, HypervisorError> {
        let out = self
            .virsh("net-dumpxml", name, &["net-dumpxml", name])
            .await?;
        Ok(out.stdout_string())
    }

    async fn update_dhcp_host(
        &self,
        network: &str,
        command: NetUpdateCommand,
        host_xml: &str,
        flags: NetUpdateFlags,
    ) -> Result<(), HypervisorError> {
        let cmd = match command {
            NetUpdateCommand::Add => "add",
            NetUpdateCommand::Delete => "delete",
        };
        let mut args = vec!["net-update", network, cmd, "ip-dhcp-host", host_xml];
        if flags.live {
            args.push("--live");
        }
        if flags.config {
            args.push("--config");
        }
        self.virsh("net-update", network, &args).await?;
        Ok(())
    }

    async fn list_dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>, HypervisorError> {
        let out = self
            .virsh("net-dhcp-leases", network, &["net-dhcp-leases", network])
            .await?;
        Ok(parse_dhcp_leases(&out.stdout_string()))
    }
}

#[async_trait]
impl AgentChannel for VirshHypervisor {
    async fn agent_invoke(
        &self,
        domain: &str,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, HypervisorError> {
        let payload = request.to_string();
        let out = self
            .virsh(
                "qemu-agent-command",
                domain,
                &["qemu-agent-command", domain, &payload],
            )
            .await?;
        serde_json::from_str(&out.stdout_string()).map_err(|e| {
            HypervisorError::new(
                "qemu-agent-command",
                domain,
                ErrorKind::Fatal,
                format!("malformed agent reply: {e}"),
            )
        })
    }
}

/// Parse `virsh dominfo` key/value output.
fn parse_dominfo(text: &str) -> DomainInfo {
    let mut info = DomainInfo {
        state: DomainState::Unknown,
        max_memory_kib: 0,
        used_memory_kib: 0,
        vcpus: 0,
        cpu_time_secs: 0.0,
    };
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "State" => info.state = DomainState::parse(value),
            "Max memory" => info.max_memory_kib = leading_number(value) as u64,
            "Used memory" => info.used_memory_kib = leading_number(value) as u64,
            "CPU(s)" => info.vcpus = leading_number(value) as u32,
            "CPU time" => info.cpu_time_secs = leading_number(value),
            _ => {}
        }
    }
    info
}

fn leading_number(value: &str) -> f64 {
    value
        .split_whitespace()
        .next()
        .and_then(|tok| tok.trim_end_matches('s').parse().ok())
        .unwrap_or(0.0)
}

/// Parse the `virsh net-dhcp-leases` table. Only IPv4 rows are kept; the
/// address column carries a `/prefix` suffix that is stripped.
fn parse_dhcp_leases(text: &str) -> Vec<DhcpLease> {
    let mut leases = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        // Expiry date + time, MAC, protocol, IP/prefix, hostname, client id.
        if cols.len() < 5 || !cols[1].contains(':') || !cols[2].contains(':') {
            continue;
        }
        if cols[3] != "ipv4" {
            continue;
        }
        let ip = cols[4].split('/').next().unwrap_or(cols[4]).to_string();
        let hostname = cols
            .get(5)
            .filter(|h| **h != "-")
            .map(|h| h.to_string());
        leases.push(DhcpLease {
            mac: cols[2].to_string(),
            ip,
            hostname,
            expiry: Some(format!("{} {}", cols[0], cols[1])),
        });
    }
    leases
}
