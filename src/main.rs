mod analysis;
mod arch;
mod catalog;
mod config;
mod daemon;
mod host;
mod hypervisor;
mod image;
mod instrument;
mod net;
mod sandbox;
mod volume;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::analysis::{AnalysisError, AnalysisOptions, AnalysisWorker};
use crate::config::Config;
use crate::daemon::protocol::{Command, Request};
use crate::daemon::{Daemon, ProductionLauncher};
use crate::host::HostRunner;
use crate::hypervisor::virsh::VirshHypervisor;
use crate::image::{ArtifactStore, Image, ImageRepository};
use crate::net::dhcp::DhcpArbiter;
use crate::net::firewall::FirewallArbiter;
use crate::sandbox::driver::{DriverConfig, SandboxDriver};
use crate::sandbox::lease::LeaseSpec;
use crate::sandbox::worker::SandboxWorker;
use crate::volume::GenisoimageEncoder;

/// Exit code for interrupted (cancelled) runs, matching shell convention.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "bottle", about = "Run untrusted samples in disposable VMs")]
enum Cli {
    /// Manage sandbox images
    #[command(subcommand)]
    Sandbox(SandboxCmd),
    /// Run an analysis directly, without the daemon
    #[command(subcommand)]
    Analysis(AnalysisCmd),
    /// The long-lived daemon and its control commands
    #[command(subcommand)]
    Daemon(DaemonCmd),
    /// Inspect lab network state
    #[command(subcommand)]
    Network(NetworkCmd),
    /// Create (or clear) the firewall tables bottle augments
    Setup {
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
enum SandboxCmd {
    /// Register a built disk image for a specification
    Build {
        spec_id: String,
        /// Bootable disk produced by the image pipeline
        #[arg(long)]
        disk: PathBuf,
    },
    /// Boot a sandbox from the newest image of a specification and keep
    /// it up until interrupted
    Run { spec_id: String },
    /// List registered images
    List,
    /// Remove an image and its artifacts
    Remove { image_id: String },
}

#[derive(Args, Clone)]
struct AnalysisArgs {
    /// Path to the sample binary
    sample: PathBuf,
    /// Declared C2 address to whitelist
    #[arg(long)]
    c2: Option<String>,
    /// Architecture override (skips sample inspection)
    #[arg(long)]
    arch: Option<String>,
    /// Arguments passed to the sample in the guest
    #[arg(long = "arg")]
    sample_args: Vec<String>,
    /// Instrumentation config file
    #[arg(long)]
    instrumentation: Option<PathBuf>,
    /// Sample execution timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    sample_timeout: u64,
    /// Sandbox lifetime in seconds (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    sandbox_lifetime: u64,
}

#[derive(Subcommand)]
enum AnalysisCmd {
    /// Analyze one sample
    Run(AnalysisArgs),
}

#[derive(Subcommand)]
enum DaemonCmd {
    /// Serve the control socket
    Serve,
    /// Start an analysis via the daemon
    Start(AnalysisArgs),
    /// Cancel a running analysis
    Stop { id: String },
    /// List analyses
    List,
    /// Inspect one analysis
    Inspect { id: String },
    /// Remove completed analyses from the registry
    Cleanup,
}

#[derive(Subcommand)]
enum NetworkCmd {
    /// Current DHCP leases and static pins on the lab network
    Leases,
    /// Active firewall whitelist pairs
    Whitelists,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bottle=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let cancelled = e
                .downcast_ref::<AnalysisError>()
                .map(AnalysisError::is_cancelled)
                .unwrap_or(false);
            if cancelled {
                tracing::info!("interrupted");
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                tracing::error!(error = %e, "command failed");
                ExitCode::FAILURE
            }
        }
    }
}

/// Cancellation token wired to Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });
    token
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli {
        Cli::Sandbox(cmd) => run_sandbox(cmd, &config).await,
        Cli::Analysis(AnalysisCmd::Run(args)) => run_analysis(args, &config).await,
        Cli::Daemon(cmd) => run_daemon(cmd, &config).await,
        Cli::Network(cmd) => run_network(cmd, &config).await,
        Cli::Setup { clear } => run_setup(clear).await,
    }
}

fn analysis_options(args: AnalysisArgs, config: &Config) -> AnalysisOptions {
    AnalysisOptions {
        sample_path: args.sample,
        c2_address: args.c2,
        image_dir: config.image_dir.clone(),
        run_dir: config.run_dir.clone(),
        connection_uri: config.connection_uri.clone(),
        override_arch: args.arch,
        sample_args: args.sample_args,
        instrumentation: args.instrumentation,
        sample_timeout: args.sample_timeout,
        sandbox_lifetime: args.sandbox_lifetime,
        log_root: config.log_root.clone(),
        log_level: None,
    }
}

async fn run_analysis(args: AnalysisArgs, config: &Config) -> Result<()> {
    let options = analysis_options(args, config);
    let worker = AnalysisWorker::production(options);
    worker.run(interrupt_token()).await?;
    Ok(())
}

// ── sandbox ─────────────────────────────────────────────────────────

async fn run_sandbox(cmd: SandboxCmd, config: &Config) -> Result<()> {
    let images = ImageRepository::new(&config.image_dir);
    match cmd {
        SandboxCmd::Build { spec_id, disk } => {
            let catalog = catalog::SpecificationRepository::embedded()?;
            let spec = catalog.get(&spec_id)?.clone();
            let store = ArtifactStore::new(&config.artifact_dir);
            let artifact = store.store(&disk, "application/x-qemu-disk")?;
            let image = Image {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: chrono::Utc::now(),
                specification: spec,
                artifact,
                companions: Vec::new(),
                metadata: Default::default(),
            };
            images.save(&image)?;
            println!("{}", image.id);
            Ok(())
        }
        SandboxCmd::Run { spec_id } => run_interactive_sandbox(&spec_id, config).await,
        SandboxCmd::List => {
            for image in images.list()? {
                println!(
                    "{}  {}  {}  {}",
                    image.id,
                    image.arch(),
                    image.specification.id,
                    image.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        SandboxCmd::Remove { image_id } => {
            let image = images.remove(&image_id)?;
            let store = ArtifactStore::new(&config.artifact_dir);
            store.remove(&image.artifact)?;
            for companion in &image.companions {
                store.remove(companion)?;
            }
            println!("removed {image_id}");
            Ok(())
        }
    }
}

/// Boot the newest image of a specification and hold it until Ctrl-C.
async fn run_interactive_sandbox(spec_id: &str, config: &Config) -> Result<()> {
    let images = ImageRepository::new(&config.image_dir);
    let image = images
        .list()?
        .into_iter()
        .find(|i| i.specification.id == spec_id)
        .with_context(|| format!("no image built for specification {spec_id}"))?;

    let runner: Arc<dyn host::CommandRunner> = Arc::new(HostRunner);
    let hv = Arc::new(VirshHypervisor::new(
        runner.clone(),
        config.connection_uri.clone(),
    ));
    let driver = Arc::new(SandboxDriver::new(
        DriverConfig {
            base_dir: config.run_dir.clone(),
            connection_uri: config.connection_uri.clone(),
        },
        hv.clone(),
        hv,
        runner.clone(),
        Arc::new(GenisoimageEncoder::new(runner)),
    ));

    let lease = driver.acquire(LeaseSpec::new(image)).await?;
    let (mut worker, _handle) = SandboxWorker::new(driver.clone(), lease);
    let started = worker.start_notifier();
    let cancel = interrupt_token();
    let join = tokio::spawn(worker.run(cancel));

    match started.await {
        Ok(snapshot) => {
            println!("sandbox {} running", snapshot.id);
            for (key, value) in &snapshot.metadata {
                println!("  {key}: {value}");
            }
            if let Ok(info) = driver.collect_metrics(&snapshot.id).await {
                println!(
                    "  vcpus: {}  memory: {} MiB  cpu time: {:.1}s",
                    info.vcpus,
                    info.used_memory_kib / 1024,
                    info.cpu_time_secs
                );
            }
            println!("press Ctrl-C to stop");
        }
        Err(_) => {
            join.await??;
            bail!("sandbox failed before reaching running state");
        }
    }

    // Worker returns on Ctrl-C (context cancellation) or driver error.
    join.await??;
    Ok(())
}

// ── daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cmd: DaemonCmd, config: &Config) -> Result<()> {
    match cmd {
        DaemonCmd::Serve => {
            let daemon = Arc::new(Daemon::new(Arc::new(ProductionLauncher)));
            daemon
                .serve(config.socket_path.clone(), interrupt_token())
                .await?;
            Ok(())
        }
        DaemonCmd::Start(args) => {
            let options = analysis_options(args, config);
            let response = daemon::request(
                &config.socket_path,
                &Request {
                    command: Command::Start,
                    id: None,
                    payload: Some(serde_json::to_value(&options)?),
                },
            )
            .await?;
            print_response(response)
        }
        DaemonCmd::Stop { id } => {
            let response = daemon::request(
                &config.socket_path,
                &Request {
                    command: Command::Stop,
                    id: Some(id),
                    payload: None,
                },
            )
            .await?;
            print_response(response)
        }
        DaemonCmd::List => {
            let response = daemon::request(
                &config.socket_path,
                &Request {
                    command: Command::List,
                    id: None,
                    payload: None,
                },
            )
            .await?;
            print_response(response)
        }
        DaemonCmd::Inspect { id } => {
            let response = daemon::request(
                &config.socket_path,
                &Request {
                    command: Command::Inspect,
                    id: Some(id),
                    payload: None,
                },
            )
            .await?;
            print_response(response)
        }
        DaemonCmd::Cleanup => {
            let response = daemon::request(
                &config.socket_path,
                &Request {
                    command: Command::Cleanup,
                    id: None,
                    payload: None,
                },
            )
            .await?;
            print_response(response)
        }
    }
}

fn print_response(response: daemon::protocol::Response) -> Result<()> {
    if !response.ok {
        bail!(response.error.unwrap_or_else(|| "daemon error".into()));
    }
    if let Some(data) = response.data {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}

// ── network / setup ─────────────────────────────────────────────────

async fn run_network(cmd: NetworkCmd, config: &Config) -> Result<()> {
    let runner: Arc<dyn host::CommandRunner> = Arc::new(HostRunner);
    match cmd {
        NetworkCmd::Leases => {
            let hv = Arc::new(VirshHypervisor::new(
                runner,
                config.connection_uri.clone(),
            ));
            let arbiter = DhcpArbiter::new(hv, config.network.clone());
            println!("dynamic leases:");
            for lease in arbiter.leases().await? {
                println!(
                    "  {}  {}  {}",
                    lease.mac,
                    lease.ip,
                    lease.hostname.as_deref().unwrap_or("-")
                );
            }
            println!("static pins:");
            for host in arbiter.pinned().await? {
                println!("  {}  {}", host.mac, host.ip);
            }
            Ok(())
        }
        NetworkCmd::Whitelists => {
            let arbiter = FirewallArbiter::new(runner);
            for rule in arbiter.list().await? {
                println!("{} -> {}", rule.vm_ip, rule.dest_ip);
            }
            Ok(())
        }
    }
}

async fn run_setup(clear: bool) -> Result<()> {
    let arbiter = FirewallArbiter::new(Arc::new(HostRunner));
    if clear {
        arbiter.clear_tables().await?;
        println!("firewall tables removed");
    } else {
        arbiter.ensure_tables().await?;
        println!("firewall tables ready");
    }
    Ok(())
}
