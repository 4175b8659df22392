//! Guest-agent channel: synchronous exec-and-wait over the hypervisor's
//! per-VM agent. This is the only control path into a running VM after
//! boot: setup scripts, mount discovery, and the sample itself all run
//! through it.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::json;

use super::{AgentChannel, HypervisorError};

/// How often `guest-exec-status` is polled while a command runs.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a command executed inside the guest. Streams arrive
/// base64-framed from the agent and are decoded here.
#[derive(Debug, Clone, Default)]
pub struct GuestCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("guest agent unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    #[error("guest command timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("guest command exited with code {}", result.exit_code)]
    CommandFailed { result: GuestCommandResult },

    #[error("malformed agent reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::TimedOut { .. })
    }
}

/// Exec-and-wait client for one domain's guest agent.
pub struct GuestAgent {
    channel: Arc<dyn AgentChannel>,
    domain: String,
}

impl GuestAgent {
    pub fn new(channel: Arc<dyn AgentChannel>, domain: impl Into<String>) -> Self {
        Self {
            channel,
            domain: domain.into(),
        }
    }

    /// Poll `guest-info` until the agent answers. Succeeds on the first
    /// reply; fails with `Unavailable` once the attempt budget is spent.
    pub async fn wait_for_guest_agent(
        &self,
        interval: Duration,
        attempts: u32,
    ) -> Result<(), AgentError> {
        for attempt in 1..=attempts {
            match self
                .channel
                .agent_invoke(&self.domain, &json!({"execute": "guest-info"}))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt == attempts => {
                    tracing::debug!(domain = %self.domain, error = %e, "guest agent never answered");
                    return Err(AgentError::Unavailable { attempts });
                }
                Err(_) => tokio::time::sleep(interval).await,
            }
        }
        Err(AgentError::Unavailable { attempts })
    }

    /// Submit `guest-exec` with output capture and poll `guest-exec-status`
    /// until the process exits. A zero `timeout` disables the deadline; a
    /// positive one fails with `TimedOut` once it expires. Non-zero exit
    /// codes surface as `CommandFailed` carrying the decoded result.
    pub async fn run_guest_command(
        &self,
        path: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<GuestCommandResult, AgentError> {
        let submit = json!({
            "execute": "guest-exec",
            "arguments": {
                "path": path,
                "arg": args,
                "capture-output": true,
            }
        });
        let reply = self.channel.agent_invoke(&self.domain, &submit).await?;
        let pid = reply["return"]["pid"]
            .as_i64()
            .ok_or_else(|| AgentError::Protocol(format!("guest-exec reply without pid: {reply}")))?;

        tracing::debug!(domain = %self.domain, path, pid, "guest command submitted");

        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };

        loop {
            let status = self
                .channel
                .agent_invoke(
                    &self.domain,
                    &json!({
                        "execute": "guest-exec-status",
                        "arguments": {"pid": pid}
                    }),
                )
                .await?;

            let ret = &status["return"];
            if ret["exited"].as_bool().unwrap_or(false) {
                let result = GuestCommandResult {
                    stdout: decode_stream(ret["out-data"].as_str()),
                    stderr: decode_stream(ret["err-data"].as_str()),
                    exit_code: ret["exitcode"].as_i64().unwrap_or(0) as i32,
                };
                if result.exit_code != 0 {
                    return Err(AgentError::CommandFailed { result });
                }
                return Ok(result);
            }

            match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(AgentError::TimedOut { timeout });
                    }
                    // Never sleep past the deadline.
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    /// Convenience form: `/bin/sh -c <script>`.
    pub async fn run_guest_shell_command(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<GuestCommandResult, AgentError> {
        self.run_guest_command("/bin/sh", &["-c".to_string(), script.to_string()], timeout)
            .await
    }
}

/// Base64-decode an agent stream field. Malformed input is coerced to an
/// empty string; the exit-code-bearing error still propagates upstream.
fn decode_stream(field: Option<&str>) -> String {
    let Some(encoded) = field else {
        return String::new();
    };
    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;
    use serde_json::json;

    fn b64(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[tokio::test]
    async fn wait_succeeds_on_first_reply() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {}}));
        let agent = GuestAgent::new(hv, "d1");
        agent
            .wait_for_guest_agent(Duration::from_millis(1), 3)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_fails_after_budget() {
        let hv = Arc::new(FakeHypervisor::new());
        let agent = GuestAgent::new(hv, "d1");
        let err = agent
            .wait_for_guest_agent(Duration::from_millis(1), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { attempts: 2 }));
    }

    #[tokio::test]
    async fn command_decodes_streams() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {"pid": 99}}));
        hv.push_agent_reply(json!({"return": {
            "exited": true,
            "exitcode": 0,
            "out-data": b64("done\n"),
            "err-data": b64("warning\n"),
        }}));
        let agent = GuestAgent::new(hv, "d1");
        let result = agent
            .run_guest_command("/bin/true", &[], Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(result.stdout, "done\n");
        assert_eq!(result.stderr, "warning\n");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_partial_result() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {"pid": 7}}));
        hv.push_agent_reply(json!({"return": {
            "exited": true,
            "exitcode": 17,
            "out-data": b64("partial"),
        }}));
        let agent = GuestAgent::new(hv, "d1");
        let err = agent
            .run_guest_command("/bin/false", &[], Duration::ZERO)
            .await
            .unwrap_err();
        match err {
            AgentError::CommandFailed { result } => {
                assert_eq!(result.exit_code, 17);
                assert_eq!(result.stdout, "partial");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_enforced_within_poll_interval() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {"pid": 7}}));
        // Never exits.
        for _ in 0..16 {
            hv.push_agent_reply(json!({"return": {"exited": false}}));
        }
        let agent = GuestAgent::new(hv, "d1");
        let started = tokio::time::Instant::now();
        let err = agent
            .run_guest_command("/bin/sleep", &["60".into()], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() <= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn zero_timeout_waits_for_exit() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {"pid": 7}}));
        hv.push_agent_reply(json!({"return": {"exited": false}}));
        hv.push_agent_reply(json!({"return": {"exited": true, "exitcode": 0}}));
        let agent = GuestAgent::new(hv, "d1");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run_guest_command("/bin/slow", &[], Duration::ZERO),
        )
        .await
        .expect("poll loop should finish")
        .unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn malformed_base64_coerced_to_empty() {
        assert_eq!(decode_stream(Some("%%% not base64 %%%")), "");
        assert_eq!(decode_stream(None), "");
        assert_eq!(decode_stream(Some(&b64("ok"))), "ok");
    }

    #[tokio::test]
    async fn shell_command_wraps_sh() {
        let hv = Arc::new(FakeHypervisor::new());
        hv.push_agent_reply(json!({"return": {"pid": 1}}));
        hv.push_agent_reply(json!({"return": {"exited": true, "exitcode": 0, "out-data": b64("x")}}));
        let agent = GuestAgent::new(hv.clone(), "d1");
        agent
            .run_guest_shell_command("echo x", Duration::ZERO)
            .await
            .unwrap();
        assert!(hv.calls().iter().any(|c| c.starts_with("agent:")));
    }
}
