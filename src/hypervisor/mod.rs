//! Hypervisor capability.
//!
//! The engine never talks to libvirt directly; it goes through the
//! `Hypervisor` trait (domain/network lifecycle) and the `AgentChannel`
//! trait (per-VM guest-agent invocations), so the whole lifecycle stack
//! can run against in-memory fakes. The production binding in `virsh.rs`
//! shells out to virsh through the host `CommandRunner`.

pub mod agent;
pub mod virsh;
pub mod xml;

use std::path::Path;

use async_trait::async_trait;

/// Classification of a hypervisor failure. Native error text leaks policy;
/// everything above this module branches only on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection-level failure; the operation may succeed on retry.
    Transient,
    /// The named domain does not exist.
    NoDomain,
    /// The named network does not exist.
    NoNetwork,
    /// The operation is not valid for the object's current state.
    OperationInvalid,
    /// Malformed or inapplicable argument (e.g. deleting an absent DHCP pin).
    InvalidArg,
    /// The guest agent is not connected or not responding.
    AgentUnavailable,
    /// Anything else.
    Fatal,
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("{op} {resource}: {message}")]
pub struct HypervisorError {
    pub op: &'static str,
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl HypervisorError {
    pub fn new(op: &'static str, resource: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            op,
            resource: resource.into(),
            kind,
            message: message.into(),
        }
    }

    /// Errors treated as success on cleanup paths: the object is already
    /// gone, or is in a state where the teardown step does not apply.
    pub fn is_ignorable(&self) -> bool {
        matches!(self.kind, ErrorKind::NoDomain | ErrorKind::OperationInvalid)
    }

    /// Errors swallowed by idempotent DHCP release.
    pub fn is_benign_release(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NoDomain | ErrorKind::OperationInvalid | ErrorKind::InvalidArg
        )
    }
}

/// Lifecycle state of a defined domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// States in which the guest is executing and the agent may answer.
    pub fn is_active(self) -> bool {
        matches!(self, DomainState::Running | DomainState::Blocked)
    }

    pub fn parse(s: &str) -> DomainState {
        match s.trim() {
            "running" => DomainState::Running,
            "blocked" | "idle" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }
}

/// Snapshot of domain resource accounting (`dominfo`).
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub used_memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_secs: f64,
}

/// One dynamic DHCP lease as reported by the network.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetUpdateCommand {
    Add,
    Delete,
}

/// Which layers of network config an update touches.
#[derive(Debug, Clone, Copy)]
pub struct NetUpdateFlags {
    pub live: bool,
    pub config: bool,
}

impl NetUpdateFlags {
    pub const BOTH: NetUpdateFlags = NetUpdateFlags {
        live: true,
        config: true,
    };
}

/// Domain and network lifecycle operations. Connections are per-operation;
/// implementations must not hold long-lived handles.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Probe the connection (used by setup and preflight checks).
    async fn verify(&self) -> Result<(), HypervisorError>;

    async fn define_domain(&self, xml_path: &Path) -> Result<(), HypervisorError>;
    async fn domain_exists(&self, name: &str) -> Result<bool, HypervisorError>;
    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError>;
    async fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError>;
    async fn domain_info(&self, name: &str) -> Result<DomainInfo, HypervisorError>;
    async fn domain_xml(&self, name: &str) -> Result<String, HypervisorError>;

    async fn describe_network(&self, name: &str) -> Result<String, HypervisorError>;
    async fn update_dhcp_host(
        &self,
        network: &str,
        command: NetUpdateCommand,
        host_xml: &str,
        flags: NetUpdateFlags,
    ) -> Result<(), HypervisorError>;
    async fn list_dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>, HypervisorError>;
}

/// Synchronous request/response over a domain's guest-agent channel.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn agent_invoke(
        &self,
        domain: &str,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value, HypervisorError>;
}
