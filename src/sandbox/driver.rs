//! Sandbox driver: turns a lease specification into a running VM and
//! later releases everything it acquired.
//!
//! Each `acquire()` call:
//! 1. Picks the lease id (domain name) and creates the run directory
//! 2. Creates a copy-on-write overlay backed by the image artifact
//! 3. Stages the setup and sample volumes and encodes them read-only
//! 4. Pins a DHCP reservation for the deterministic MAC
//! 5. Renders and writes the domain XML
//!
//! Everything acquired is rolled back on error (DHCP pin, overlay, run
//! directory), and `release()` is total: it must leave the host clean
//! even when the hypervisor is unreachable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::catalog::BootMethod;
use crate::host::{CommandError, CommandRunner};
use crate::hypervisor::agent::{AgentError, GuestAgent, GuestCommandResult};
use crate::hypervisor::{AgentChannel, DomainInfo, Hypervisor, HypervisorError};
use crate::image::ArtifactError;
use crate::net::dhcp::{DhcpArbiter, DhcpReservation, NetError};
use crate::volume::{self, VolumeEncoder, VolumeError};

use super::domain::{Boot, CdAttachment, DomainTemplate, tap_interface_for_mac};
use super::lease::{
    Lease, LeaseSpec, SandboxCommand, SandboxState, derive_mac, meta_keys, runtime_keys,
};

/// Identifies this driver in lease metadata.
pub const DRIVER_TAG: &str = "libvirt";

pub const GUEST_AGENT_WAIT_INTERVAL: Duration = Duration::from_secs(5);
pub const GUEST_AGENT_WAIT_ATTEMPTS: u32 = 24;
pub const GUEST_MOUNT_TIMEOUT: Duration = Duration::from_secs(120);

const EXEC_AGENT_WAIT_INTERVAL: Duration = Duration::from_secs(1);
const EXEC_AGENT_WAIT_ATTEMPTS: u32 = 5;

const DOMAIN_XML_FILE: &str = "domain.xml";
const OVERLAY_FILE: &str = "disk-overlay.qcow2";
const SETUP_ISO: &str = "setup.iso";
const SAMPLE_ISO: &str = "sample.iso";
const SETUP_FILES_DIR: &str = "setup_files";
const SETUP_DATA_DIR: &str = "setup_data";
const SAMPLE_DATA_DIR: &str = "sample_data";

const MOUNT_DISCOVERY_SCRIPT: &str = include_str!("../../assets/guest/mount-volumes.sh");

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("invalid driver configuration: {0}")]
    Config(String),

    #[error("override specification is not supported")]
    UnsupportedOverride,

    #[error("kernel boot requires kernel and initrd paths")]
    KernelBootIncomplete,

    #[error("image artifact is unusable: {0}")]
    BadImage(String),

    #[error("run directory already exists: {0}")]
    RunDirExists(PathBuf),

    #[error("guest mount discovery failed: {0}")]
    MountDiscovery(String),

    #[error("setup script {name} failed with exit code {code}")]
    SetupScript { name: String, code: i32 },

    #[error("sandbox interrupted: domain {domain} is not running")]
    SandboxInterrupted { domain: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl DriverError {
    /// Guest-command timeout on the sample is downgraded upstream.
    pub fn is_guest_timeout(&self) -> bool {
        matches!(self, DriverError::Agent(e) if e.is_timeout())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DriverError + '_ {
    move |source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Root under which each lease owns `<base_dir>/<leaseId>/`.
    pub base_dir: PathBuf,
    pub connection_uri: String,
}

impl DriverConfig {
    fn validate(&self) -> Result<(), DriverError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(DriverError::Config("base directory is empty".into()));
        }
        if self.connection_uri.is_empty() {
            return Err(DriverError::Config("connection URI is empty".into()));
        }
        Ok(())
    }
}

pub struct SandboxDriver {
    config: DriverConfig,
    hypervisor: Arc<dyn Hypervisor>,
    agent_channel: Arc<dyn AgentChannel>,
    runner: Arc<dyn CommandRunner>,
    encoder: Arc<dyn VolumeEncoder>,
}

/// Resources to unwind when acquire fails partway.
#[derive(Default)]
struct Rollback {
    dhcp: Option<(String, DhcpReservation)>,
    overlay: Option<PathBuf>,
    run_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct MountPoints {
    setup: String,
    sample: String,
}

impl SandboxDriver {
    pub fn new(
        config: DriverConfig,
        hypervisor: Arc<dyn Hypervisor>,
        agent_channel: Arc<dyn AgentChannel>,
        runner: Arc<dyn CommandRunner>,
        encoder: Arc<dyn VolumeEncoder>,
    ) -> Self {
        Self {
            config,
            hypervisor,
            agent_channel,
            runner,
            encoder,
        }
    }

    fn dhcp_arbiter(&self, network: &str) -> DhcpArbiter {
        DhcpArbiter::new(self.hypervisor.clone(), network)
    }

    // ── Acquire ─────────────────────────────────────────────────

    pub async fn acquire(&self, spec: LeaseSpec) -> Result<Lease, DriverError> {
        self.config.validate()?;
        if spec.override_specification.is_some() {
            return Err(DriverError::UnsupportedOverride);
        }

        let id = match spec.domain_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!(
                "{}-{}",
                spec.image.specification.run.domain_prefix,
                uuid::Uuid::new_v4()
            ),
        };
        let run_dir = self.config.base_dir.join(&id);

        let mut rollback = Rollback::default();
        match self.acquire_inner(&spec, &id, &run_dir, &mut rollback).await {
            Ok(lease) => Ok(lease),
            Err(e) => {
                tracing::warn!(lease = %id, error = %e, "acquire failed, rolling back");
                self.unwind(rollback).await;
                Err(e)
            }
        }
    }

    async fn acquire_inner(
        &self,
        spec: &LeaseSpec,
        id: &str,
        run_dir: &Path,
        rollback: &mut Rollback,
    ) -> Result<Lease, DriverError> {
        let osspec = &spec.image.specification;

        std::fs::create_dir_all(&self.config.base_dir).map_err(io_err(&self.config.base_dir))?;
        std::fs::create_dir(run_dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                DriverError::RunDirExists(run_dir.to_path_buf())
            } else {
                io_err(run_dir)(e)
            }
        })?;
        rollback.run_dir = Some(run_dir.to_path_buf());

        // 1. Copy-on-write overlay over the image artifact.
        let backing = spec.image.artifact.path()?;
        let backing_format = backing_format(spec)?;
        let overlay = run_dir.join(OVERLAY_FILE);
        self.runner
            .run(
                "qemu-img",
                &[
                    "create",
                    "-f",
                    "qcow2",
                    "-b",
                    &backing.to_string_lossy(),
                    "-F",
                    &backing_format,
                    &overlay.to_string_lossy(),
                ],
            )
            .await?
            .check()?;
        rollback.overlay = Some(overlay.clone());

        // 2. Domain template data from the frozen specification.
        let boot = match osspec.run.boot {
            BootMethod::Bios => Boot::Bios,
            BootMethod::KernelDirect => {
                match (&osspec.run.kernel_path, &osspec.run.initrd_path) {
                    (Some(kernel), Some(initrd)) => Boot::Kernel {
                        kernel: kernel.clone(),
                        initrd: initrd.clone(),
                        cmdline: osspec.run.kernel_cmdline.clone(),
                    },
                    _ => return Err(DriverError::KernelBootIncomplete),
                }
            }
        };
        let mac = derive_mac(id);

        // 3. Setup volume: extract the embedded setup files, mirror them
        // into staging, stamp the marker.
        let setup_files = run_dir.join(SETUP_FILES_DIR);
        std::fs::create_dir(&setup_files).map_err(io_err(&setup_files))?;
        let staged = staged_setup_files(osspec);
        for (name, content) in &staged {
            let path = setup_files.join(name);
            std::fs::write(&path, content).map_err(io_err(&path))?;
        }
        let setup_data = run_dir.join(SETUP_DATA_DIR);
        volume::mirror_directory(&setup_files, &setup_data)?;
        volume::write_setup_marker(&setup_data)?;
        let setup_iso = run_dir.join(SETUP_ISO);
        self.encoder
            .encode(&setup_data, &setup_iso, &format!("{id}-setup"))
            .await?;

        let mut cds = vec![CdAttachment {
            iso_path: setup_iso,
            target_dev: osspec.setup_device(),
            bus: osspec.domain.cd_bus.clone(),
        }];

        // 4. Sample volume, when a sample directory was supplied.
        if let Some(sample_dir) = &spec.sample_dir {
            let sample_data = run_dir.join(SAMPLE_DATA_DIR);
            volume::mirror_directory(sample_dir, &sample_data)?;
            let sample_iso = run_dir.join(SAMPLE_ISO);
            self.encoder
                .encode(&sample_data, &sample_iso, &format!("{id}-sample"))
                .await?;
            cds.push(CdAttachment {
                iso_path: sample_iso,
                target_dev: osspec.sample_device(),
                bus: osspec.domain.cd_bus.clone(),
            });
        }

        // 5. DHCP reservation for the deterministic MAC.
        let network = osspec.run.network_name.clone();
        let reservation = self.dhcp_arbiter(&network).acquire(&mac).await?;
        rollback.dhcp = Some((network.clone(), reservation.clone()));

        // 6. Render and persist the domain description.
        let template = DomainTemplate {
            name: id.to_string(),
            arch: osspec.domain.arch,
            machine: osspec.domain.machine.clone(),
            cpu_model: osspec.domain.cpu_model.clone(),
            vcpus: osspec.effective_vcpus(),
            ram_mb: osspec.effective_ram_mb(),
            boot,
            overlay_path: overlay.clone(),
            overlay_format: "qcow2".into(),
            disk_bus: osspec.domain.disk_bus.clone(),
            disk_target: osspec.domain.disk_target.clone(),
            cds,
            network_name: network.clone(),
            network_model: osspec.domain.network_model.clone(),
            mac: mac.clone(),
        };
        let domain_xml_path = run_dir.join(DOMAIN_XML_FILE);
        std::fs::write(&domain_xml_path, template.render()).map_err(io_err(&domain_xml_path))?;

        let mut runtime = BTreeMap::new();
        runtime.insert(runtime_keys::DOMAIN_NAME.into(), id.to_string());
        runtime.insert(
            runtime_keys::DOMAIN_XML.into(),
            domain_xml_path.to_string_lossy().to_string(),
        );
        runtime.insert(
            runtime_keys::OVERLAY_PATH.into(),
            overlay.to_string_lossy().to_string(),
        );
        runtime.insert(
            runtime_keys::BASE_IMAGE.into(),
            backing.to_string_lossy().to_string(),
        );
        runtime.insert(
            runtime_keys::CONNECTION_URI.into(),
            self.config.connection_uri.clone(),
        );
        runtime.insert(runtime_keys::NETWORK_NAME.into(), network);
        runtime.insert(runtime_keys::DHCP_MAC.into(), reservation.mac.clone());
        runtime.insert(runtime_keys::DHCP_IP.into(), reservation.ip.to_string());
        let script_names: Vec<&str> = staged.iter().map(|(name, _)| name.as_str()).collect();
        runtime.insert(
            runtime_keys::SETUP_SCRIPTS.into(),
            serde_json::to_string(&script_names).expect("names serialize"),
        );

        let mut metadata = BTreeMap::new();
        metadata.insert(meta_keys::DRIVER.into(), DRIVER_TAG.into());
        metadata.insert(meta_keys::DOMAIN_NAME.into(), id.to_string());
        metadata.insert(meta_keys::IMAGE_ID.into(), spec.image.id.clone());
        metadata.insert(meta_keys::VM_IP.into(), reservation.ip.to_string());
        metadata.insert(meta_keys::VM_MAC.into(), mac);

        tracing::info!(
            lease = %id,
            ip = %reservation.ip,
            image = %spec.image.id,
            "acquired sandbox lease"
        );

        Ok(Lease {
            id: id.to_string(),
            state: SandboxState::Pending,
            start_time: None,
            run_dir: run_dir.to_path_buf(),
            runtime,
            metadata,
        })
    }

    async fn unwind(&self, rollback: Rollback) {
        if let Some((network, reservation)) = rollback.dhcp {
            if let Err(e) = self.dhcp_arbiter(&network).release(&reservation).await {
                tracing::warn!(error = %e, "rollback: DHCP release failed");
            }
        }
        if let Some(overlay) = rollback.overlay {
            if let Err(e) = std::fs::remove_file(&overlay) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %overlay.display(), error = %e, "rollback: overlay delete failed");
                }
            }
        }
        if let Some(run_dir) = rollback.run_dir {
            if let Err(e) = std::fs::remove_dir_all(&run_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %run_dir.display(), error = %e, "rollback: run dir delete failed");
                }
            }
        }
    }

    // ── Start ───────────────────────────────────────────────────

    pub async fn start(&self, lease: &mut Lease) -> Result<(), DriverError> {
        let id = lease.id.clone();

        let xml_path = lease
            .runtime_value(runtime_keys::DOMAIN_XML)
            .map(PathBuf::from)
            .ok_or_else(|| DriverError::Config("lease has no domain XML".into()))?;

        if !self.hypervisor.domain_exists(&id).await? {
            self.hypervisor.define_domain(&xml_path).await?;
        }
        let state = self.hypervisor.domain_state(&id).await?;
        if !state.is_active() {
            self.hypervisor.start_domain(&id).await?;
        }

        let agent = GuestAgent::new(self.agent_channel.clone(), &id);
        agent
            .wait_for_guest_agent(GUEST_AGENT_WAIT_INTERVAL, GUEST_AGENT_WAIT_ATTEMPTS)
            .await?;

        // Discover where the guest mounted the staged volumes.
        let discovery = agent
            .run_guest_shell_command(MOUNT_DISCOVERY_SCRIPT, GUEST_MOUNT_TIMEOUT)
            .await?;
        let mounts = parse_mount_points(&discovery.stdout)?;
        if mounts.setup.is_empty() {
            return Err(DriverError::MountDiscovery(
                "no volume with setup marker found".into(),
            ));
        }
        lease
            .metadata
            .insert(meta_keys::SETUP_MOUNT.into(), mounts.setup.clone());
        if !mounts.sample.is_empty() {
            lease
                .metadata
                .insert(meta_keys::SAMPLE_MOUNT.into(), mounts.sample.clone());
        }

        // Run the staged setup scripts, in order, aborting on failure.
        for name in setup_script_names(lease) {
            let guest_path = format!("{}/{}", mounts.setup, volume::iso9660_relative_path(&name));
            tracing::debug!(lease = %id, script = %guest_path, "running setup script");
            match agent
                .run_guest_command(
                    "/bin/bash",
                    &[guest_path.clone()],
                    GUEST_MOUNT_TIMEOUT,
                )
                .await
            {
                Ok(_) => {}
                Err(AgentError::CommandFailed { result }) => {
                    return Err(DriverError::SetupScript {
                        name,
                        code: result.exit_code,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Resolve the host-side tap interface for instrumentation.
        if let Some(mac) = lease.runtime_value(runtime_keys::DHCP_MAC) {
            let live_xml = self.hypervisor.domain_xml(&id).await?;
            match tap_interface_for_mac(&live_xml, mac) {
                Some(tap) => {
                    lease.metadata.insert(meta_keys::VM_INTERFACE.into(), tap);
                }
                None => {
                    tracing::warn!(lease = %id, mac, "no tap interface found for MAC");
                }
            }
        }

        lease.state = SandboxState::Running;
        lease.start_time = Some(Utc::now());
        tracing::info!(lease = %id, "sandbox running");
        Ok(())
    }

    // ── Execute ─────────────────────────────────────────────────

    /// Run a command inside a started sandbox. The caller's timeout is
    /// passed through unchanged; zero means no deadline.
    pub async fn execute(
        &self,
        domain: &str,
        command: &SandboxCommand,
    ) -> Result<GuestCommandResult, DriverError> {
        if !self.hypervisor.domain_exists(domain).await? {
            return Err(DriverError::SandboxInterrupted {
                domain: domain.to_string(),
            });
        }
        let agent = GuestAgent::new(self.agent_channel.clone(), domain);
        agent
            .wait_for_guest_agent(EXEC_AGENT_WAIT_INTERVAL, EXEC_AGENT_WAIT_ATTEMPTS)
            .await?;
        Ok(agent
            .run_guest_command(&command.path, &command.args, command.timeout)
            .await?)
    }

    // ── Release ─────────────────────────────────────────────────

    /// Tear down everything the lease owns. With `force` every failure is
    /// logged and release continues; without it, only benign hypervisor
    /// errors (domain already gone, operation invalid) are ignored. The
    /// filesystem is cleaned even when the hypervisor is unreachable.
    pub async fn release(&self, lease: &mut Lease, force: bool) -> Result<(), DriverError> {
        let id = lease.id.clone();

        let destroy = self.hypervisor.destroy_domain(&id).await;
        self.absorb_release_error("destroy", &id, destroy, force)?;

        let undefine = self.hypervisor.undefine_domain(&id).await;
        self.absorb_release_error("undefine", &id, undefine, force)?;

        if let (Some(network), Some(mac), Some(ip)) = (
            lease.runtime_value(runtime_keys::NETWORK_NAME),
            lease.runtime_value(runtime_keys::DHCP_MAC),
            lease.runtime_value(runtime_keys::DHCP_IP),
        ) {
            let reservation = DhcpReservation {
                mac: mac.to_string(),
                ip: ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
            };
            match self.dhcp_arbiter(network).release(&reservation).await {
                Ok(()) => {}
                Err(e) if force => {
                    tracing::warn!(lease = %id, error = %e, "forced release: DHCP release failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match std::fs::remove_dir_all(&lease.run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if force => {
                tracing::warn!(lease = %id, error = %e, "forced release: run dir delete failed");
            }
            Err(e) => return Err(io_err(&lease.run_dir)(e)),
        }

        lease.state = SandboxState::Stopped;
        tracing::info!(lease = %id, "released sandbox lease");
        Ok(())
    }

    fn absorb_release_error(
        &self,
        op: &str,
        id: &str,
        result: Result<(), HypervisorError>,
        force: bool,
    ) -> Result<(), DriverError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_ignorable() => Ok(()),
            Err(e) if force => {
                tracing::warn!(lease = %id, %op, error = %e, "forced release: hypervisor error ignored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Metrics ─────────────────────────────────────────────────

    pub async fn collect_metrics(&self, domain: &str) -> Result<DomainInfo, DriverError> {
        let info = self.hypervisor.domain_info(domain).await?;
        if !info.state.is_active() {
            return Err(DriverError::SandboxInterrupted {
                domain: domain.to_string(),
            });
        }
        Ok(info)
    }
}

/// Infer the backing format for the overlay: artifact content-type,
/// then image metadata `disk_format`, then the file extension.
fn backing_format(spec: &LeaseSpec) -> Result<String, DriverError> {
    match spec.image.artifact.content_type.as_str() {
        "application/x-qemu-disk" => return Ok("qcow2".into()),
        _ => {}
    }
    if let Some(format) = spec.image.metadata.get("disk_format") {
        return Ok(format.clone());
    }
    match spec.image.artifact.extension().as_deref() {
        Some("qcow2") => Ok("qcow2".into()),
        Some("img") | Some("raw") => Ok("raw".into()),
        other => Err(DriverError::BadImage(format!(
            "cannot infer disk format (extension {other:?})"
        ))),
    }
}

/// Sanitized, duplicate-suffixed file names for the embedded setup
/// artifacts, paired with their content, in specification order.
fn staged_setup_files(spec: &crate::catalog::Specification) -> Vec<(String, String)> {
    let mut seen: BTreeMap<String, u32> = BTreeMap::new();
    let mut out = Vec::with_capacity(spec.setup_files.len());
    for file in &spec.setup_files {
        let base = Path::new(&file.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .unwrap_or_else(|| "setup-file".to_string());
        let count = seen.entry(base.clone()).or_insert(0);
        let name = if *count == 0 {
            base.clone()
        } else {
            match base.rsplit_once('.') {
                Some((stem, ext)) => format!("{stem}-{count}.{ext}"),
                None => format!("{base}-{count}"),
            }
        };
        *count += 1;
        out.push((name, file.content.clone()));
    }
    out
}

/// Staged setup-script names recorded in the lease runtime config.
fn setup_script_names(lease: &Lease) -> Vec<String> {
    lease
        .runtime_value(runtime_keys::SETUP_SCRIPTS)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn parse_mount_points(stdout: &str) -> Result<MountPoints, DriverError> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .ok_or_else(|| DriverError::MountDiscovery(format!("no JSON in output: {stdout:?}")))?;
    serde_json::from_str(line)
        .map_err(|e| DriverError::MountDiscovery(format!("malformed JSON {line:?}: {e}")))
}
