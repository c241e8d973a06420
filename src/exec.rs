//! Non-interactive command execution
//!
//! Every short-lived subprocess (systemctl, journalctl, ss, ip, openvpn
//! self-test) goes through [`CommandRunner`] so callers can be exercised
//! against a scripted runner instead of the host.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{NodeError, NodeResult};

/// A command to run with its own deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }

    /// Human readable form used in logs and errors
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, None when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs commands on behalf of the probe, editor and monitor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Spawn failures map to `CommandFailed`, an expired
    /// deadline to `Timeout`; a non-zero exit is NOT an error.
    async fn run(&self, spec: CommandSpec) -> NodeResult<CommandOutput>;
}

/// Runs commands on the local host with tokio::process
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> NodeResult<CommandOutput> {
        let cmd_str = spec.display();
        debug!("Running: {}", cmd_str);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);

        let output = match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(NodeError::CommandFailed {
                    cmd: cmd_str,
                    code: None,
                    stderr: e.to_string(),
                })
            }
            Err(_) => return Err(NodeError::timeout(cmd_str, spec.timeout)),
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
