//! Network-sensor instrumentation: a long-lived subprocess driven by a
//! templated configuration file, attached to the sandbox's host-side
//! tap interface. The rendered config is materialized to a temporary
//! path for the process lifetime and deleted on close.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::template::expand;
use super::{Instrument, InstrumentError, InstrumentVars, VAR_VM_INTERFACE};

pub struct NetworkSensorInstrument {
    label: String,
    binary: PathBuf,
    config_template: String,
    requires: Vec<String>,
    rendered_config: Option<PathBuf>,
    child: Option<Child>,
    closing: bool,
}

impl NetworkSensorInstrument {
    /// `requires` always gains `VmInterface`: a sensor without an
    /// interface to listen on cannot start.
    pub fn new(binary: PathBuf, config_template: String, mut requires: Vec<String>) -> Self {
        if !requires.iter().any(|r| r == VAR_VM_INTERFACE) {
            requires.push(VAR_VM_INTERFACE.to_string());
        }
        let label = binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "sensor".to_string());
        Self {
            label,
            binary,
            config_template,
            requires,
            rendered_config: None,
            child: None,
            closing: false,
        }
    }
}

#[async_trait]
impl Instrument for NetworkSensorInstrument {
    fn label(&self) -> &str {
        &self.label
    }

    fn requires(&self) -> &[String] {
        &self.requires
    }

    async fn start(&mut self, vars: &InstrumentVars) -> Result<(), InstrumentError> {
        let rendered = expand(&self.config_template, &vars.as_pairs());
        let config_path = std::env::temp_dir().join(format!(
            "bottle-{}-{}.conf",
            self.label,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&config_path, rendered)
            .await
            .map_err(|source| InstrumentError::Io {
                path: config_path.clone(),
                source,
            })?;

        let child = Command::new(&self.binary)
            .arg("-c")
            .arg(&config_path)
            .arg("-i")
            .arg(&vars.vm_interface)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InstrumentError::Spawn {
                name: self.label.clone(),
                source,
            })?;

        tracing::info!(
            instrument = %self.label,
            pid = ?child.id(),
            interface = %vars.vm_interface,
            config = %config_path.display(),
            "network sensor started"
        );

        self.rendered_config = Some(config_path);
        self.child = Some(child);
        Ok(())
    }

    fn running(&mut self) -> Result<(), InstrumentError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(_)) if self.closing => Ok(()),
            Ok(Some(status)) if status.code().is_none() => Ok(()),
            Ok(Some(status)) => Err(InstrumentError::RunFailed {
                name: self.label.clone(),
                code: status.code(),
            }),
            Err(source) => Err(InstrumentError::Spawn {
                name: self.label.clone(),
                source,
            }),
        }
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        self.closing = true;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(config) = self.rendered_config.take() {
            match tokio::fs::remove_file(&config).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(InstrumentError::Io {
                        path: config,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> InstrumentVars {
        InstrumentVars {
            sample_name: "mal.bin".into(),
            vm_ip: "10.0.0.4".into(),
            vm_interface: "lo".into(),
            c2_ip: String::new(),
            start_time: "20260801T000000Z".into(),
            run_dir: "/tmp".into(),
            log_dir: "/tmp".into(),
        }
    }

    #[test]
    fn vm_interface_is_always_required() {
        let sensor = NetworkSensorInstrument::new("/bin/cat".into(), String::new(), vec![]);
        assert!(sensor.requires().iter().any(|r| r == VAR_VM_INTERFACE));

        let sensor = NetworkSensorInstrument::new(
            "/bin/cat".into(),
            String::new(),
            vec![VAR_VM_INTERFACE.to_string()],
        );
        assert_eq!(
            sensor
                .requires()
                .iter()
                .filter(|r| *r == VAR_VM_INTERFACE)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn rendered_config_is_written_and_removed() {
        // `sleep` ignores the -c/-i arguments it never reads; the process
        // just has to outlive the assertions.
        let mut sensor = NetworkSensorInstrument::new(
            "/bin/sleep".into(),
            "interface: {{ .VmInterface }}\n".into(),
            vec![],
        );
        // sleep parses its first argument; "-c" fails it immediately,
        // which is fine for the filesystem assertions.
        sensor.start(&vars()).await.unwrap();
        let config = sensor.rendered_config.clone().unwrap();
        assert!(config.exists());
        let content = std::fs::read_to_string(&config).unwrap();
        assert_eq!(content, "interface: lo\n");

        sensor.close().await.unwrap();
        assert!(!config.exists());
        // Close twice: already cleaned up.
        sensor.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_fails_spawn() {
        let mut sensor = NetworkSensorInstrument::new(
            "/nonexistent/sensor-binary".into(),
            String::new(),
            vec![],
        );
        let err = sensor.start(&vars()).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Spawn { .. }));
    }
}
