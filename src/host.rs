//! Host command execution.
//!
//! Everything bottle does to the host (virsh, qemu-img, nft, genisoimage,
//! file(1)) goes through the `CommandRunner` capability so tests can swap
//! in scripted fakes without touching the components above it.

use std::process::Stdio;

use async_trait::async_trait;

/// Errors from running a host command.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Captured output of a finished host command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub program: String,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Returns an error unless the command exited with code 0.
    pub fn check(self) -> Result<CommandOutput, CommandError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CommandError::Failed {
                program: self.program.clone(),
                code: self.exit_code,
                stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            })
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run a subcommand on the host and capture its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;
}

/// Direct execution on the local host.
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        if program.is_empty() {
            return Err(CommandError::Empty);
        }

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        Ok(CommandOutput {
            program: program.to_string(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted command runner for tests. Each expected invocation is
    //! matched by program name (and optionally a substring of the joined
    //! args) and answers with a canned output.

    use std::sync::Mutex;

    use super::*;

    pub struct Script {
        pub program: String,
        pub args_contain: Option<String>,
        pub exit_code: i32,
        pub stdout: String,
        pub stderr: String,
    }

    #[derive(Default)]
    pub struct FakeRunner {
        scripts: Mutex<Vec<Script>>,
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect(&self, program: &str, args_contain: Option<&str>, exit: i32, stdout: &str) {
            self.scripts.lock().unwrap().push(Script {
                program: program.to_string(),
                args_contain: args_contain.map(String::from),
                exit_code: exit,
                stdout: stdout.to_string(),
                stderr: String::new(),
            });
        }

        pub fn expect_err(&self, program: &str, args_contain: Option<&str>, exit: i32, stderr: &str) {
            self.scripts.lock().unwrap().push(Script {
                program: program.to_string(),
                args_contain: args_contain.map(String::from),
                exit_code: exit,
                stdout: String::new(),
                stderr: stderr.to_string(),
            });
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
            let joined = args.join(" ");
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));

            let scripts = self.scripts.lock().unwrap();
            let hit = scripts.iter().find(|s| {
                s.program == program
                    && s.args_contain
                        .as_deref()
                        .map(|needle| joined.contains(needle))
                        .unwrap_or(true)
            });

            match hit {
                Some(s) => Ok(CommandOutput {
                    program: program.to_string(),
                    exit_code: Some(s.exit_code),
                    stdout: s.stdout.clone().into_bytes(),
                    stderr: s.stderr.clone().into_bytes(),
                }),
                None => Ok(CommandOutput {
                    program: program.to_string(),
                    exit_code: Some(0),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let runner = HostRunner;
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_string(), "hello");
    }

    #[tokio::test]
    async fn check_surfaces_nonzero_exit() {
        let runner = HostRunner;
        let out = runner.run("sh", &["-c", "echo oops >&2; exit 3"]).await.unwrap();
        let err = out.check().unwrap_err();
        match err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_program_is_rejected() {
        let runner = HostRunner;
        assert!(matches!(
            runner.run("", &[]).await,
            Err(CommandError::Empty)
        ));
    }

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let runner = HostRunner;
        let err = runner
            .run("/nonexistent/definitely-not-a-binary", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-binary"));
    }
}
