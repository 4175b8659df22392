//! Instrumentation: auxiliary host-side processes that observe one
//! analysis (packet capture, network sensors). Instruments declare the
//! variables they require; missing variables skip the instrument rather
//! than failing the run, while a process that dies during warm-up does
//! fail it.

pub mod config;
pub mod sensor;
pub mod shell;
pub mod template;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub use config::load_instruments;

/// Warm-up period between starting instrumentation and the health check.
pub const WARMUP_PERIOD: Duration = Duration::from_secs(5);

/// The closed set of instrumentation variable names.
pub const VAR_SAMPLE_NAME: &str = "SampleName";
pub const VAR_VM_IP: &str = "VmIp";
pub const VAR_VM_INTERFACE: &str = "VmInterface";
pub const VAR_C2_IP: &str = "C2Ip";
pub const VAR_START_TIME: &str = "StartTime";
pub const VAR_RUN_DIR: &str = "RunDir";
pub const VAR_LOG_DIR: &str = "LogDir";

#[derive(thiserror::Error, Debug)]
pub enum InstrumentError {
    #[error("missing required variables: {}", .0.join(", "))]
    MissingRequiredVariables(Vec<String>),

    #[error("instrumentation {name} exited with code {code:?} during the run")]
    RunFailed { name: String, code: Option<i32> },

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed instrumentation config {path}: {detail}")]
    BadConfig { path: PathBuf, detail: String },
}

/// Values exposed to instrumentation templates. `StartTime` is already
/// formatted (`YYYYMMDDThhmmssZ`, UTC).
#[derive(Debug, Clone, Default)]
pub struct InstrumentVars {
    pub sample_name: String,
    pub vm_ip: String,
    pub vm_interface: String,
    pub c2_ip: String,
    pub start_time: String,
    pub run_dir: String,
    pub log_dir: String,
}

impl InstrumentVars {
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            VAR_SAMPLE_NAME => &self.sample_name,
            VAR_VM_IP => &self.vm_ip,
            VAR_VM_INTERFACE => &self.vm_interface,
            VAR_C2_IP => &self.c2_ip,
            VAR_START_TIME => &self.start_time,
            VAR_RUN_DIR => &self.run_dir,
            VAR_LOG_DIR => &self.log_dir,
            _ => return None,
        };
        Some(value.as_str())
    }

    pub fn as_pairs(&self) -> Vec<(&'static str, &str)> {
        vec![
            (VAR_SAMPLE_NAME, &self.sample_name),
            (VAR_VM_IP, &self.vm_ip),
            (VAR_VM_INTERFACE, &self.vm_interface),
            (VAR_C2_IP, &self.c2_ip),
            (VAR_START_TIME, &self.start_time),
            (VAR_RUN_DIR, &self.run_dir),
            (VAR_LOG_DIR, &self.log_dir),
        ]
    }

    /// Names from `requires` whose value is empty or unknown.
    pub fn missing(&self, requires: &[String]) -> Vec<String> {
        requires
            .iter()
            .filter(|name| self.get(name).map(|v| v.is_empty()).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// One auxiliary observer process.
#[async_trait]
pub trait Instrument: Send {
    fn label(&self) -> &str;

    /// Variable names that must be non-empty at start time.
    fn requires(&self) -> &[String];

    async fn start(&mut self, vars: &InstrumentVars) -> Result<(), InstrumentError>;

    /// `Ok` while the process lives. Exits caused by our own shutdown
    /// (kill) are coerced to `Ok` so normal teardown is not reported as
    /// failure; any other exit is a `RunFailed`.
    fn running(&mut self) -> Result<(), InstrumentError>;

    /// Terminate the process and clean up rendered files.
    async fn close(&mut self) -> Result<(), InstrumentError>;
}

/// Owns the instrument set for one analysis.
pub struct Supervisor {
    instruments: Vec<Box<dyn Instrument>>,
    started: Vec<usize>,
}

impl Supervisor {
    pub fn new(instruments: Vec<Box<dyn Instrument>>) -> Self {
        Self {
            instruments,
            started: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Start every instrument whose required variables are satisfied.
    /// Instruments with missing variables are logged and skipped.
    pub async fn start_all(&mut self, vars: &InstrumentVars) -> Result<(), InstrumentError> {
        for (idx, instrument) in self.instruments.iter_mut().enumerate() {
            let missing = vars.missing(instrument.requires());
            if !missing.is_empty() {
                tracing::warn!(
                    instrument = instrument.label(),
                    missing = %missing.join(", "),
                    "skipping instrumentation with missing required variables"
                );
                continue;
            }
            instrument.start(vars).await?;
            self.started.push(idx);
        }
        Ok(())
    }

    /// Post-warm-up health check over everything that started.
    pub fn check_all(&mut self) -> Result<(), InstrumentError> {
        for idx in &self.started {
            self.instruments[*idx].running()?;
        }
        Ok(())
    }

    /// Close in reverse start order. The first real error wins, but
    /// every instrument is still closed.
    pub async fn close_all(&mut self) -> Result<(), InstrumentError> {
        let mut first_err = None;
        for idx in self.started.drain(..).rev() {
            if let Err(e) = self.instruments[idx].close().await {
                tracing::warn!(error = %e, "instrumentation close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        label: String,
        requires: Vec<String>,
        started: bool,
        alive: bool,
        closed: bool,
    }

    impl Scripted {
        fn new(label: &str, requires: &[&str]) -> Self {
            Self {
                label: label.into(),
                requires: requires.iter().map(|s| s.to_string()).collect(),
                started: false,
                alive: true,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl Instrument for Scripted {
        fn label(&self) -> &str {
            &self.label
        }

        fn requires(&self) -> &[String] {
            &self.requires
        }

        async fn start(&mut self, _vars: &InstrumentVars) -> Result<(), InstrumentError> {
            self.started = true;
            Ok(())
        }

        fn running(&mut self) -> Result<(), InstrumentError> {
            if self.alive {
                Ok(())
            } else {
                Err(InstrumentError::RunFailed {
                    name: self.label.clone(),
                    code: Some(1),
                })
            }
        }

        async fn close(&mut self) -> Result<(), InstrumentError> {
            self.closed = true;
            Ok(())
        }
    }

    fn vars() -> InstrumentVars {
        InstrumentVars {
            sample_name: "mal.bin".into(),
            vm_ip: "10.0.0.4".into(),
            vm_interface: "vnet3".into(),
            c2_ip: "203.0.113.4".into(),
            start_time: "20260801T120000Z".into(),
            run_dir: "/run/bottle/x".into(),
            log_dir: "/var/log/bottle/x".into(),
        }
    }

    #[test]
    fn missing_reports_empty_and_unknown() {
        let mut v = vars();
        v.vm_interface = String::new();
        let missing = v.missing(&["VmInterface".into(), "VmIp".into(), "NotAVar".into()]);
        assert_eq!(missing, vec!["VmInterface".to_string(), "NotAVar".to_string()]);
    }

    #[tokio::test]
    async fn start_all_skips_unsatisfied_instruments() {
        let mut v = vars();
        v.vm_interface = String::new();
        let mut sup = Supervisor::new(vec![
            Box::new(Scripted::new("needs-iface", &["VmInterface"])),
            Box::new(Scripted::new("needs-ip", &["VmIp"])),
        ]);
        sup.start_all(&v).await.unwrap();
        assert_eq!(sup.started, vec![1]);
        sup.check_all().unwrap();
    }

    #[tokio::test]
    async fn check_all_surfaces_dead_instrument() {
        let mut dead = Scripted::new("capture", &[]);
        dead.alive = false;
        let mut sup = Supervisor::new(vec![Box::new(dead)]);
        sup.start_all(&vars()).await.unwrap();
        let err = sup.check_all().unwrap_err();
        assert!(matches!(err, InstrumentError::RunFailed { .. }));
    }

    #[tokio::test]
    async fn close_all_closes_only_started() {
        let mut v = vars();
        v.c2_ip = String::new();
        let mut sup = Supervisor::new(vec![
            Box::new(Scripted::new("a", &["C2Ip"])),
            Box::new(Scripted::new("b", &[])),
        ]);
        sup.start_all(&v).await.unwrap();
        sup.close_all().await.unwrap();
        assert!(sup.started.is_empty());
    }
}
