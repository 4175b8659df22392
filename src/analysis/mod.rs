//! Analysis worker: end-to-end orchestration for one sample.
//!
//! Detects the sample's architecture, selects an image, acquires and
//! starts a sandbox through its worker, installs the firewall whitelist,
//! runs instrumentation, executes the sample in the guest, and arms the
//! post-sample and sandbox-lifetime timers. Cleanup runs in reverse
//! order on every exit path: instrumentation first, firewall rules last.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::arch::{self, Arch, ArchError};
use crate::host::{CommandError, CommandRunner, HostRunner};
use crate::hypervisor::virsh::VirshHypervisor;
use crate::hypervisor::{AgentChannel, Hypervisor};
use crate::image::{ImageError, ImageRepository};
use crate::instrument::{
    self, InstrumentError, InstrumentVars, Supervisor, load_instruments,
};
use crate::net::firewall::{FirewallArbiter, FirewallError, WhitelistCleanup};
use crate::sandbox::driver::{DriverConfig, DriverError, SandboxDriver};
use crate::sandbox::lease::{Lease, LeaseSnapshot, LeaseSpec, SandboxCommand, meta_keys};
use crate::sandbox::worker::{SandboxWorker, WorkerError};
use crate::volume::{self, GenisoimageEncoder};

/// Grace period between the sample finishing and the stop signal.
pub const POST_SAMPLE_DELAY: Duration = Duration::from_secs(5);

/// Timestamp format used for log directories and instrumentation vars.
pub const START_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("sample not found: {0}")]
    SampleNotFound(PathBuf),

    #[error("sample is a directory: {0}")]
    SampleIsDirectory(PathBuf),

    #[error("sandbox worker never reached running state")]
    NeverStarted,

    #[error("lease carries no sample mount path")]
    NoSampleMount,

    #[error("analysis cancelled")]
    Cancelled,

    #[error(transparent)]
    Arch(#[from] ArchError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl AnalysisError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            AnalysisError::Cancelled => true,
            AnalysisError::Worker(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Wire-visible options for one analysis. Durations are seconds; zero
/// disables the corresponding deadline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisOptions {
    pub sample_path: PathBuf,
    pub c2_address: Option<String>,
    pub image_dir: PathBuf,
    pub run_dir: PathBuf,
    #[serde(rename = "connectionURI")]
    pub connection_uri: String,
    pub override_arch: Option<String>,
    pub sample_args: Vec<String>,
    /// Path to the instrumentation config file.
    pub instrumentation: Option<PathBuf>,
    pub sample_timeout: u64,
    pub sandbox_lifetime: u64,
    pub log_root: PathBuf,
    pub log_level: Option<String>,
}

impl AnalysisOptions {
    pub fn sample_name(&self) -> String {
        self.sample_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "sample".to_string())
    }
}

/// Snapshot written to `<logDir>/analysis-config.json`.
#[derive(Debug, Serialize)]
struct AnalysisConfigSnapshot<'a> {
    lease_id: &'a str,
    sample: &'a Path,
    arch: Arch,
    image_id: &'a str,
    c2_address: Option<&'a str>,
    started_at: Option<DateTime<Utc>>,
    options: &'a AnalysisOptions,
}

pub struct AnalysisWorker {
    options: AnalysisOptions,
    runner: Arc<dyn CommandRunner>,
    hypervisor: Arc<dyn Hypervisor>,
    agent_channel: Arc<dyn AgentChannel>,
    encoder: Arc<dyn volume::VolumeEncoder>,
}

impl AnalysisWorker {
    /// Production wiring: virsh hypervisor and genisoimage encoder over
    /// the local host runner.
    pub fn production(options: AnalysisOptions) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
        let hv = Arc::new(VirshHypervisor::new(
            runner.clone(),
            options.connection_uri.clone(),
        ));
        let encoder = Arc::new(GenisoimageEncoder::new(runner.clone()));
        Self {
            options,
            runner,
            hypervisor: hv.clone(),
            agent_channel: hv,
            encoder,
        }
    }

    /// Test wiring with explicit capabilities.
    pub fn with_capabilities(
        options: AnalysisOptions,
        runner: Arc<dyn CommandRunner>,
        hypervisor: Arc<dyn Hypervisor>,
        agent_channel: Arc<dyn AgentChannel>,
        encoder: Arc<dyn volume::VolumeEncoder>,
    ) -> Self {
        Self {
            options,
            runner,
            hypervisor,
            agent_channel,
            encoder,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), AnalysisError> {
        let sample = self.options.sample_path.clone();
        if !sample.exists() {
            return Err(AnalysisError::SampleNotFound(sample));
        }
        if sample.is_dir() {
            return Err(AnalysisError::SampleIsDirectory(sample));
        }

        // 1. Architecture: caller override, else classify the sample.
        let arch = match self.options.override_arch.as_deref() {
            Some(name) => arch::normalize(name)?,
            None => self.detect_arch(&sample).await?,
        };

        // 2. Newest image for the architecture.
        let images = ImageRepository::new(&self.options.image_dir);
        let image = images.select_for_arch(arch)?;
        tracing::info!(
            sample = %sample.display(),
            %arch,
            image = %image.id,
            "starting analysis"
        );

        // 3. Driver + lease specification; the sample's directory is
        // mounted so the sample lands in the guest.
        let driver = Arc::new(SandboxDriver::new(
            DriverConfig {
                base_dir: self.options.run_dir.clone(),
                connection_uri: self.options.connection_uri.clone(),
            },
            self.hypervisor.clone(),
            self.agent_channel.clone(),
            self.runner.clone(),
            self.encoder.clone(),
        ));
        let mut lease_spec = LeaseSpec::new(image.clone());
        lease_spec.sample_dir = sample.parent().map(Path::to_path_buf);

        let mut lease = driver.acquire(lease_spec).await?;

        // 4. Firewall whitelist for the declared C2; removed last.
        let fw_cleanup = match self.install_whitelist(&lease).await {
            Ok(cleanup) => cleanup,
            Err(e) => {
                driver.release(&mut lease, true).await.ok();
                return Err(e);
            }
        };

        let result = self
            .run_with_lease(driver, lease, arch, &image.id, &cancel)
            .await;

        // Firewall cleanup runs after everything else has wound down.
        if let Some(cleanup) = fw_cleanup {
            if let Err(e) = cleanup.remove().await {
                tracing::warn!(error = %e, "firewall cleanup failed");
            }
        }

        result
    }

    async fn detect_arch(&self, sample: &Path) -> Result<Arch, AnalysisError> {
        let out = self
            .runner
            .run("file", &["-b", &sample.to_string_lossy()])
            .await?
            .check()?;
        Ok(arch::detect(&out.stdout_string())?)
    }

    async fn install_whitelist(
        &self,
        lease: &Lease,
    ) -> Result<Option<WhitelistCleanup>, AnalysisError> {
        let Some(c2) = self.options.c2_address.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let vm_ip = lease
            .metadata_value(meta_keys::VM_IP)
            .ok_or(FirewallError::MissingVmIp)?;
        let arbiter = FirewallArbiter::new(self.runner.clone());
        Ok(Some(arbiter.whitelist(vm_ip, c2).await?))
    }

    async fn run_with_lease(
        &self,
        driver: Arc<SandboxDriver>,
        lease: Lease,
        arch: Arch,
        image_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        // 5. Spawn the sandbox worker and wait for "running".
        let (mut worker, handle) = SandboxWorker::new(driver, lease);
        let started = worker.start_notifier();
        let worker_cancel = cancel.child_token();
        let mut join = tokio::spawn(worker.run(worker_cancel));

        let snapshot = match started.await {
            Ok(snapshot) => snapshot,
            // Worker died before running; its return value says why.
            Err(_) => {
                return match (&mut join).await.expect("worker task panicked") {
                    Ok(()) => Err(AnalysisError::NeverStarted),
                    Err(e) => Err(e.into()),
                };
            }
        };

        // 6. Instrumentation with warm-up and health check.
        let vars = self.instrument_vars(&snapshot);
        let mut supervisor = self.build_supervisor()?;
        let instrument_result = self
            .start_instrumentation(&mut supervisor, &vars, cancel)
            .await;

        let result = match instrument_result {
            Err(e) => Err(e),
            Ok(()) => {
                self.run_sample(&snapshot, &handle, &vars, arch, image_id, cancel)
                    .await
            }
        };

        // 7. Stop the worker (idempotent if it already terminated) and
        // wait for release to finish.
        let _ = handle.stop().await;
        let worker_result = join.await.expect("worker task panicked");

        // 8. Instrumentation closes before the firewall cleanup.
        if let Err(e) = supervisor.close_all().await {
            tracing::warn!(error = %e, "instrumentation shutdown failed");
        }

        match result {
            Ok(()) => {
                worker_result?;
                if cancel.is_cancelled() {
                    return Err(AnalysisError::Cancelled);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn instrument_vars(&self, snapshot: &LeaseSnapshot) -> InstrumentVars {
        let start_time = snapshot
            .start_time
            .map(|t| t.format(START_TIME_FORMAT).to_string())
            .unwrap_or_default();
        let log_dir = self
            .options
            .log_root
            .join(format!("{}-{}", self.options.sample_name(), start_time));
        InstrumentVars {
            sample_name: self.options.sample_name(),
            vm_ip: snapshot
                .metadata_value(meta_keys::VM_IP)
                .unwrap_or_default()
                .to_string(),
            vm_interface: snapshot
                .metadata_value(meta_keys::VM_INTERFACE)
                .unwrap_or_default()
                .to_string(),
            c2_ip: self.options.c2_address.clone().unwrap_or_default(),
            start_time,
            run_dir: snapshot.run_dir.to_string_lossy().to_string(),
            log_dir: log_dir.to_string_lossy().to_string(),
        }
    }

    fn build_supervisor(&self) -> Result<Supervisor, AnalysisError> {
        let instruments = match &self.options.instrumentation {
            Some(path) => load_instruments(path)?,
            None => Vec::new(),
        };
        Ok(Supervisor::new(instruments))
    }

    async fn start_instrumentation(
        &self,
        supervisor: &mut Supervisor,
        vars: &InstrumentVars,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        std::fs::create_dir_all(&vars.log_dir).map_err(|source| AnalysisError::Io {
            path: PathBuf::from(&vars.log_dir),
            source,
        })?;

        if supervisor.is_empty() {
            return Ok(());
        }
        supervisor.start_all(vars).await?;

        tokio::select! {
            _ = tokio::time::sleep(instrument::WARMUP_PERIOD) => {}
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
        }
        supervisor.check_all()?;
        Ok(())
    }

    async fn run_sample(
        &self,
        snapshot: &LeaseSnapshot,
        handle: &crate::sandbox::worker::WorkerHandle,
        vars: &InstrumentVars,
        arch: Arch,
        image_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        self.write_config_snapshot(snapshot, vars, arch, image_id)?;

        // Reconstruct the in-guest sample path: the encoder mangled the
        // file name when the sample volume was staged.
        let sample_mount = snapshot
            .metadata_value(meta_keys::SAMPLE_MOUNT)
            .ok_or(AnalysisError::NoSampleMount)?;
        let guest_path = format!(
            "{sample_mount}/{}",
            volume::iso9660_relative_path(&self.options.sample_name())
        );

        let command = SandboxCommand {
            path: guest_path.clone(),
            args: self.options.sample_args.clone(),
            timeout: Duration::from_secs(self.options.sample_timeout),
        };

        tracing::info!(lease = %snapshot.id, path = %guest_path, "executing sample");

        // The sample execution (plus post-sample delay) races the
        // sandbox-lifetime deadline; whichever finishes first stops the
        // sandbox. A zero lifetime disables that deadline.
        let lifetime = Duration::from_secs(self.options.sandbox_lifetime);
        let execute_then_linger = async {
            match handle.execute(command).await {
                Ok(result) => {
                    tracing::info!(
                        lease = %snapshot.id,
                        exit_code = result.exit_code,
                        "sample finished"
                    );
                }
                Err(e) if e.is_guest_timeout() => {
                    tracing::warn!(lease = %snapshot.id, "sample execution timed out in guest");
                }
                Err(e) => return Err(AnalysisError::from(e)),
            }
            tokio::time::sleep(POST_SAMPLE_DELAY).await;
            Ok(())
        };

        tokio::select! {
            result = execute_then_linger => result,
            _ = tokio::time::sleep(lifetime), if !lifetime.is_zero() => {
                tracing::info!(lease = %snapshot.id, "sandbox lifetime reached");
                Ok(())
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }

    fn write_config_snapshot(
        &self,
        snapshot: &LeaseSnapshot,
        vars: &InstrumentVars,
        arch: Arch,
        image_id: &str,
    ) -> Result<(), AnalysisError> {
        let path = PathBuf::from(&vars.log_dir).join("analysis-config.json");
        let doc = AnalysisConfigSnapshot {
            lease_id: &snapshot.id,
            sample: &self.options.sample_path,
            arch,
            image_id,
            c2_address: self.options.c2_address.as_deref(),
            started_at: snapshot.start_time,
            options: &self.options,
        };
        let raw = serde_json::to_vec_pretty(&doc).expect("snapshot serializes");
        std::fs::write(&path, raw).map_err(|source| AnalysisError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SpecificationRepository;
    use crate::host::fake::FakeRunner;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::image::{Artifact, Image};
    use crate::volume::{VolumeEncoder, VolumeError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FakeEncoder;

    #[async_trait]
    impl VolumeEncoder for FakeEncoder {
        async fn encode(&self, _src: &Path, output: &Path, _label: &str) -> Result<(), VolumeError> {
            std::fs::write(output, b"iso").map_err(|source| VolumeError::Io {
                path: output.to_path_buf(),
                source,
            })
        }
    }

    fn b64(s: &str) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    fn push_exec(hv: &FakeHypervisor, pid: i64, exitcode: i32, stdout: &str) {
        hv.push_agent_reply(json!({"return": {"pid": pid}}));
        hv.push_agent_reply(json!({"return": {
            "exited": true,
            "exitcode": exitcode,
            "out-data": b64(stdout),
        }}));
    }

    struct Fixture {
        hv: Arc<FakeHypervisor>,
        runner: Arc<FakeRunner>,
        options: AnalysisOptions,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        // Sample on disk.
        let sample_dir = root.join("samples");
        std::fs::create_dir(&sample_dir).unwrap();
        let sample = sample_dir.join("mal.bin");
        std::fs::write(&sample, b"\x7fELF").unwrap();

        // One x86_64 image.
        let catalog = SpecificationRepository::embedded().unwrap();
        let spec = catalog.get("debian-bookworm-x86_64").unwrap().clone();
        let disk = root.join("base.qcow2");
        std::fs::write(&disk, b"base").unwrap();
        let image = Image {
            id: "img-1".into(),
            created_at: Utc::now(),
            specification: spec,
            artifact: Artifact {
                uri: format!("file://{}", disk.display()),
                checksum: "0".repeat(64),
                content_type: "application/x-qemu-disk".into(),
                created_at: Utc::now(),
            },
            companions: Vec::new(),
            metadata: BTreeMap::new(),
        };
        let images = ImageRepository::new(root.join("images"));
        images.save(&image).unwrap();

        let hv = Arc::new(FakeHypervisor::new());
        hv.state.lock().unwrap().network_xml =
            "<network><ip><dhcp><range start='10.0.0.2' end='10.0.0.20'/></dhcp></ip></network>"
                .into();

        let runner = Arc::new(FakeRunner::new());
        runner.expect(
            "file",
            None,
            0,
            "ELF 64-bit LSB executable, x86-64, version 1 (SYSV)\n",
        );

        let options = AnalysisOptions {
            sample_path: sample,
            c2_address: Some("203.0.113.4".into()),
            image_dir: root.join("images"),
            run_dir: root.join("run"),
            connection_uri: "qemu:///system".into(),
            override_arch: None,
            sample_args: vec![],
            instrumentation: None,
            sample_timeout: 0,
            sandbox_lifetime: 0,
            log_root: root.join("logs"),
            log_level: None,
        };

        Fixture {
            hv,
            runner,
            options,
            _dir: dir,
        }
    }

    fn worker(f: &Fixture) -> AnalysisWorker {
        AnalysisWorker::with_capabilities(
            f.options.clone(),
            f.runner.clone(),
            f.hv.clone(),
            f.hv.clone(),
            Arc::new(FakeEncoder),
        )
    }

    /// Queue agent replies for a clean start: the domain will be defined
    /// by the driver, so seed it after acquire via define_domain.
    fn queue_clean_start(hv: &FakeHypervisor) {
        hv.push_agent_reply(json!({"return": {}}));
        push_exec(hv, 100, 0, "{\"setup\":\"/media/setup\",\"sample\":\"/media/sample\"}\n");
        push_exec(hv, 101, 0, "");
        push_exec(hv, 102, 0, "");
        push_exec(hv, 103, 0, "");
    }

    #[tokio::test(start_paused = true)]
    async fn full_analysis_runs_and_releases() {
        let f = fixture();
        queue_clean_start(&f.hv);
        // Sample execution: agent probe + exec pair.
        f.hv.push_agent_reply(json!({"return": {}}));
        push_exec(&f.hv, 200, 0, "sample output");

        let w = worker(&f);
        w.run(CancellationToken::new()).await.unwrap();

        let calls = f.hv.calls();
        assert!(calls.iter().any(|c| c.starts_with("define:")));
        assert!(calls.iter().any(|c| c.starts_with("start:")));
        assert_eq!(calls.iter().filter(|c| c.starts_with("undefine:")).count(), 1);

        // Firewall rules were installed and later removed.
        let nft_calls: Vec<_> = f
            .runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == "nft")
            .map(|(_, a)| a.clone())
            .collect();
        assert!(nft_calls.iter().any(|a| a.first().map(String::as_str) == Some("insert")));

        // The analysis-config snapshot landed in the log directory.
        let log_root = f.options.log_root.clone();
        let run_logs: Vec<_> = std::fs::read_dir(&log_root).unwrap().flatten().collect();
        assert_eq!(run_logs.len(), 1);
        assert!(run_logs[0].path().join("analysis-config.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn guest_timeout_is_downgraded_to_warning() {
        let f = fixture();
        queue_clean_start(&f.hv);
        // Execution: probe ok, exec submits, status never exits. With a
        // 1-second timeout the guest command times out, which must not
        // fail the analysis.
        f.hv.push_agent_reply(json!({"return": {}}));
        f.hv.push_agent_reply(json!({"return": {"pid": 300}}));
        for _ in 0..8 {
            f.hv.push_agent_reply(json!({"return": {"exited": false}}));
        }

        let mut f = f;
        f.options.sample_timeout = 1;
        let w = worker(&f);
        w.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_architecture_fails_before_acquire() {
        let f = fixture();
        let runner = Arc::new(FakeRunner::new());
        runner.expect("file", None, 0, "data\n");
        let w = AnalysisWorker::with_capabilities(
            f.options.clone(),
            runner,
            f.hv.clone(),
            f.hv.clone(),
            Arc::new(FakeEncoder),
        );
        let err = w.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Arch(_)));
        assert!(f.hv.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_image_fails() {
        let mut f = fixture();
        f.options.image_dir = f.options.image_dir.join("empty");
        let w = worker(&f);
        let err = w.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Image(ImageError::NoImage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn override_arch_skips_detection() {
        let mut f = fixture();
        f.options.override_arch = Some("amd64".into());
        // No `file` expectation: detection must not run.
        let runner = Arc::new(FakeRunner::new());
        queue_clean_start(&f.hv);
        f.hv.push_agent_reply(json!({"return": {}}));
        push_exec(&f.hv, 200, 0, "");

        let w = AnalysisWorker::with_capabilities(
            f.options.clone(),
            runner.clone(),
            f.hv.clone(),
            f.hv.clone(),
            Arc::new(FakeEncoder),
        );
        w.run(CancellationToken::new()).await.unwrap();
        assert!(
            runner
                .calls
                .lock()
                .unwrap()
                .iter()
                .all(|(p, _)| p != "file")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_run() {
        let f = fixture();
        queue_clean_start(&f.hv);
        // The sample execution never finishes; cancellation must win.
        f.hv.push_agent_reply(json!({"return": {}}));
        f.hv.push_agent_reply(json!({"return": {"pid": 300}}));
        for _ in 0..64 {
            f.hv.push_agent_reply(json!({"return": {"exited": false}}));
        }

        let mut f = f;
        f.options.sample_timeout = 0;
        let cancel = CancellationToken::new();
        let w = worker(&f);
        let run = tokio::spawn(w.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The sandbox was still released.
        assert_eq!(
            f.hv.calls().iter().filter(|c| c.starts_with("undefine:")).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_lifetime_deadline_stops_the_sandbox() {
        let mut f = fixture();
        queue_clean_start(&f.hv);
        // Execution hangs; the lifetime deadline must fire the stop.
        f.hv.push_agent_reply(json!({"return": {}}));
        f.hv.push_agent_reply(json!({"return": {"pid": 300}}));
        for _ in 0..64 {
            f.hv.push_agent_reply(json!({"return": {"exited": false}}));
        }
        f.options.sandbox_lifetime = 3;

        let w = worker(&f);
        w.run(CancellationToken::new()).await.unwrap();
        assert_eq!(
            f.hv.calls().iter().filter(|c| c.starts_with("undefine:")).count(),
            1
        );
    }
}
