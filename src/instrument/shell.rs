//! Shell-command instrumentation: a templated command line run under
//! `/bin/sh -c`, with output either inherited or redirected to a
//! per-process log file in the run's log directory.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::template::expand;
use super::{Instrument, InstrumentError, InstrumentVars};

pub struct ShellCommandInstrument {
    label: String,
    command_template: String,
    requires: Vec<String>,
    redirect_output: bool,
    child: Option<Child>,
    closing: bool,
}

impl ShellCommandInstrument {
    pub fn new(command_template: String, requires: Vec<String>, redirect_output: bool) -> Self {
        let label = derive_label(&command_template);
        Self {
            label,
            command_template,
            requires,
            redirect_output,
            child: None,
            closing: false,
        }
    }
}

/// Label from the command's first token: basename, filtered to
/// `[A-Za-z0-9_-]`.
fn derive_label(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or("shell");
    let base = first.rsplit('/').next().unwrap_or(first);
    let label: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if label.is_empty() {
        "shell".to_string()
    } else {
        label
    }
}

#[async_trait]
impl Instrument for ShellCommandInstrument {
    fn label(&self) -> &str {
        &self.label
    }

    fn requires(&self) -> &[String] {
        &self.requires
    }

    async fn start(&mut self, vars: &InstrumentVars) -> Result<(), InstrumentError> {
        let rendered = expand(&self.command_template, &vars.as_pairs());

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&rendered);
        if !vars.log_dir.is_empty() {
            cmd.current_dir(&vars.log_dir);
        }
        cmd.kill_on_drop(true);

        if self.redirect_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        cmd.stdin(Stdio::null());

        let mut child = cmd.spawn().map_err(|source| InstrumentError::Spawn {
            name: self.label.clone(),
            source,
        })?;

        if self.redirect_output {
            let pid = child.id().unwrap_or_default();
            let log_path =
                PathBuf::from(&vars.log_dir).join(format!("{}-{}.log", self.label, pid));
            let file = tokio::fs::File::create(&log_path)
                .await
                .map_err(|source| InstrumentError::Io {
                    path: log_path.clone(),
                    source,
                })?;
            pipe_output(&mut child, file);
            tracing::info!(
                instrument = %self.label,
                pid,
                log = %log_path.display(),
                "shell instrumentation started"
            );
        } else {
            tracing::info!(
                instrument = %self.label,
                pid = ?child.id(),
                "shell instrumentation started (inherited output)"
            );
        }

        self.child = Some(child);
        Ok(())
    }

    fn running(&mut self) -> Result<(), InstrumentError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            // Shutdown we initiated, or a signal kill, is not a failure.
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
        Ok(())
    }
}

/// Drain stdout and stderr into the same log file.
fn pipe_output(child: &mut Child, file: tokio::fs::File) {
    use tokio::io::AsyncReadExt;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let mut file = file;
        let mut bufs = Vec::new();
        if let Some(out) = stdout {
            bufs.push(tokio::spawn(async move {
                let mut out = out;
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            }));
        }
        if let Some(err) = stderr {
            bufs.push(tokio::spawn(async move {
                let mut err = err;
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                buf
            }));
        }
        for task in bufs {
            if let Ok(buf) = task.await {
                let _ = file.write_all(&buf).await;
            }
        }
        let _ = file.flush().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_from_first_token() {
        assert_eq!(derive_label("/usr/bin/tcpdump -i vnet0"), "tcpdump");
        assert_eq!(derive_label("tshark"), "tshark");
        assert_eq!(derive_label("  "), "shell");
    }

    fn vars(log_dir: &str) -> InstrumentVars {
        InstrumentVars {
            sample_name: "s".into(),
            vm_ip: "10.0.0.4".into(),
            vm_interface: "lo".into(),
            c2_ip: String::new(),
            start_time: "20260801T000000Z".into(),
            run_dir: log_dir.to_string(),
            log_dir: log_dir.to_string(),
        }
    }

    #[tokio::test]
    async fn long_running_command_reports_running_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = ShellCommandInstrument::new("sleep 30".into(), vec![], true);
        inst.start(&vars(&dir.path().to_string_lossy())).await.unwrap();
        inst.running().unwrap();
        inst.close().await.unwrap();
        // Closed instruments do not report failure.
        inst.running().unwrap();
    }

    #[tokio::test]
    async fn exited_command_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = ShellCommandInstrument::new("exit 3".into(), vec![], true);
        inst.start(&vars(&dir.path().to_string_lossy())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let err = inst.running().unwrap_err();
        assert!(matches!(err, InstrumentError::RunFailed { code: Some(3), .. }));
        inst.close().await.unwrap();
    }

    #[tokio::test]
    async fn output_is_redirected_to_labelled_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = ShellCommandInstrument::new("echo observed".into(), vec![], true);
        inst.start(&vars(&dir.path().to_string_lossy())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        inst.close().await.unwrap();

        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("echo-"))
            .collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(logs[0].path()).unwrap();
        assert!(content.contains("observed"));
    }

    #[tokio::test]
    async fn template_variables_expand_in_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst =
            ShellCommandInstrument::new("echo {{ .VmIp }}".into(), vec!["VmIp".into()], true);
        inst.start(&vars(&dir.path().to_string_lossy())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        inst.close().await.unwrap();

        let mut found = false;
        for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            if content.contains("10.0.0.4") {
                found = true;
            }
        }
        assert!(found);
    }
}
