//! Service status probe
//!
//! Read-only queries against systemd, the socket table, the journal and the
//! openvpn binary, plus the two service actions (enable, restart). Every
//! query degrades to a negative answer instead of an error so callers can
//! build a report from partial information.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::directives;
use crate::config::{CommandTimeouts, OpenVpnSettings};
use crate::error::{NodeError, NodeResult};
use crate::exec::{CommandRunner, CommandSpec};

/// Snapshot of the managed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub enabled: bool,
    pub active_state: String,
    pub error: Option<String>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            running: false,
            enabled: false,
            active_state: "unknown".to_string(),
            error: None,
        }
    }
}

/// Outcome of the openvpn self-test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl SyntaxCheck {
    fn valid() -> Self {
        Self { valid: true, error: None }
    }
}

pub struct ServiceProbe {
    runner: Arc<dyn CommandRunner>,
    settings: OpenVpnSettings,
    timeouts: CommandTimeouts,
    restart_settle: Duration,
}

impl ServiceProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: OpenVpnSettings,
        timeouts: CommandTimeouts,
        restart_settle: Duration,
    ) -> Self {
        Self {
            runner,
            settings,
            timeouts,
            restart_settle,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.settings.service_name
    }

    async fn systemctl(&self, verb: &str, timeout_secs: u64) -> NodeResult<crate::exec::CommandOutput> {
        let spec = CommandSpec::new(
            "systemctl",
            [verb, self.settings.service_name.as_str()],
            Duration::from_secs(timeout_secs),
        );
        self.runner.run(spec).await
    }

    /// Query `is-active` and `is-enabled` by exit code. Never fails; a
    /// broken query is reported through `error`.
    pub async fn check_service_status(&self) -> ServiceStatus {
        let mut status = ServiceStatus::default();

        match self.systemctl("is-active", self.timeouts.systemctl_query).await {
            Ok(output) => {
                let state = output.stdout.trim();
                if !state.is_empty() {
                    status.active_state = state.to_string();
                }
                status.running = output.success();
            }
            Err(e) => {
                error!("Error checking service status: {}", e);
                status.error = Some(e.to_string());
                return status;
            }
        }

        match self.systemctl("is-enabled", self.timeouts.systemctl_query).await {
            // enabled, static and alias units all exit 0
            Ok(output) => status.enabled = output.success(),
            Err(e) => {
                error!("Error checking service enablement: {}", e);
                status.error = Some(e.to_string());
            }
        }

        status
    }

    /// True iff the socket table lists `:<port>` for the protocol family
    pub async fn check_port_listening(&self, port: u16, protocol: &str) -> bool {
        let flags = if protocol.starts_with("udp") { "-ulnp" } else { "-tlnp" };
        let spec = CommandSpec::new("ss", [flags], Duration::from_secs(self.timeouts.socket_query));

        match self.runner.run(spec).await {
            Ok(output) if output.success() => output.stdout.contains(&format!(":{}", port)),
            Ok(output) => {
                warn!("ss {} exited with {:?}", flags, output.code);
                false
            }
            Err(e) => {
                error!("Error checking port listening: {}", e);
                false
            }
        }
    }

    /// Port and protocol from the server config, falling back to the
    /// protocol defaults for anything missing or unreadable.
    pub async fn get_config_port_protocol(&self) -> (u16, String) {
        let default = (self.settings.default_port, self.settings.default_proto.clone());

        let text = match tokio::fs::read_to_string(&self.settings.config_file).await {
            Ok(text) => text,
            Err(e) => {
                debug!("Cannot read {}: {}", self.settings.config_file.display(), e);
                return default;
            }
        };

        (
            directives::port(&text).unwrap_or(default.0),
            directives::proto(&text).unwrap_or(default.1),
        )
    }

    /// Run `openvpn --config <file> --test-crypto` with the first binary
    /// found. No binary, or a self-test that cannot run, counts as valid.
    pub async fn validate_config_syntax(&self) -> SyntaxCheck {
        let mut binary = None;
        for candidate in &self.settings.binary_candidates {
            if tokio::fs::metadata(candidate).await.is_ok() {
                binary = Some(candidate.clone());
                break;
            }
        }

        let Some(binary) = binary else {
            debug!("OpenVPN binary not found, skipping syntax validation");
            return SyntaxCheck::valid();
        };

        let spec = CommandSpec::new(
            &binary.to_string_lossy(),
            [
                "--config".to_string(),
                self.settings.config_file.to_string_lossy().to_string(),
                "--test-crypto".to_string(),
            ],
            Duration::from_secs(self.timeouts.syntax_check),
        );

        match self.runner.run(spec).await {
            Ok(output) if output.success() => SyntaxCheck::valid(),
            Ok(output) => {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                SyntaxCheck {
                    valid: false,
                    error: Some(detail),
                }
            }
            Err(e) => {
                warn!("Config syntax validation skipped: {}", e);
                SyntaxCheck::valid()
            }
        }
    }

    /// Last `lines` journal lines of the unit
    pub async fn get_service_logs(&self, lines: usize) -> NodeResult<String> {
        let spec = CommandSpec::new(
            "journalctl",
            [
                "-u".to_string(),
                self.settings.service_name.clone(),
                "-n".to_string(),
                lines.to_string(),
                "--no-pager".to_string(),
            ],
            Duration::from_secs(self.timeouts.journal),
        );

        let output = self.runner.run(spec.clone()).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(NodeError::CommandFailed {
                cmd: spec.display(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    pub async fn enable_service(&self) -> bool {
        match self.systemctl("enable", self.timeouts.systemctl_enable).await {
            Ok(output) if output.success() => {
                info!("Enabled {}", self.settings.service_name);
                true
            }
            Ok(output) => {
                error!("Failed to enable service: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                error!("Error enabling service: {}", e);
                false
            }
        }
    }

    /// Restart the unit and give it a moment to settle
    pub async fn restart_service(&self) -> bool {
        info!("Restarting {}", self.settings.service_name);
        match self.systemctl("restart", self.timeouts.systemctl_restart).await {
            Ok(output) if output.success() => {
                tokio::time::sleep(self.restart_settle).await;
                info!("Service restarted");
                true
            }
            Ok(output) => {
                error!("Failed to restart service: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                error!("Error restarting service: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn probe_with(runner: MockCommandRunner, settings: OpenVpnSettings) -> ServiceProbe {
        ServiceProbe::new(Arc::new(runner), settings, CommandTimeouts::default(), Duration::ZERO)
    }

    fn settings_for(config: &NamedTempFile) -> OpenVpnSettings {
        OpenVpnSettings {
            config_file: config.path().to_path_buf(),
            binary_candidates: Vec::new(),
            ..OpenVpnSettings::default()
        }
    }

    #[tokio::test]
    async fn test_status_active_and_enabled() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Ok(match spec.args[0].as_str() {
                "is-active" => CommandOutput::ok("active\n"),
                "is-enabled" => CommandOutput::ok("enabled\n"),
                other => panic!("unexpected verb {other}"),
            })
        });

        let status = probe_with(runner, OpenVpnSettings::default()).check_service_status().await;
        assert!(status.running);
        assert!(status.enabled);
        assert_eq!(status.active_state, "active");
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_status_inactive_disabled() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Ok(match spec.args[0].as_str() {
                "is-active" => CommandOutput {
                    code: Some(3),
                    stdout: "failed\n".into(),
                    stderr: String::new(),
                },
                _ => CommandOutput {
                    code: Some(1),
                    stdout: "disabled\n".into(),
                    stderr: String::new(),
                },
            })
        });

        let status = probe_with(runner, OpenVpnSettings::default()).check_service_status().await;
        assert!(!status.running);
        assert!(!status.enabled);
        assert_eq!(status.active_state, "failed");
    }

    #[tokio::test]
    async fn test_status_query_error_is_captured() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|spec| Err(NodeError::timeout(spec.display(), spec.timeout)));

        let status = probe_with(runner, OpenVpnSettings::default()).check_service_status().await;
        assert!(!status.running);
        assert_eq!(status.active_state, "unknown");
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_port_listening_uses_protocol_table() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Ok(match spec.args[0].as_str() {
                "-ulnp" => CommandOutput::ok("UNCONN 0 0 0.0.0.0:1194 0.0.0.0:* users:((\"openvpn\"))\n"),
                _ => CommandOutput::ok("LISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n"),
            })
        });
        let probe = probe_with(runner, OpenVpnSettings::default());

        assert!(probe.check_port_listening(1194, "udp").await);
        assert!(!probe.check_port_listening(1194, "tcp").await);
        assert!(!probe.check_port_listening(1195, "udp").await);
    }

    #[tokio::test]
    async fn test_config_port_protocol() {
        let mut config = NamedTempFile::new().unwrap();
        write!(config, "port 1195\nproto tcp\n").unwrap();
        let probe = probe_with(MockCommandRunner::new(), settings_for(&config));

        assert_eq!(probe.get_config_port_protocol().await, (1195, "tcp".to_string()));
    }

    #[tokio::test]
    async fn test_config_port_protocol_defaults() {
        let settings = OpenVpnSettings {
            config_file: "/nonexistent/server.conf".into(),
            ..OpenVpnSettings::default()
        };
        let probe = probe_with(MockCommandRunner::new(), settings);
        assert_eq!(probe.get_config_port_protocol().await, (1194, "udp".to_string()));

        let mut config = NamedTempFile::new().unwrap();
        write!(config, "dev tun\n").unwrap();
        let probe = probe_with(MockCommandRunner::new(), settings_for(&config));
        assert_eq!(probe.get_config_port_protocol().await, (1194, "udp".to_string()));
    }

    #[tokio::test]
    async fn test_syntax_check_without_binary_is_valid() {
        let config = NamedTempFile::new().unwrap();
        let probe = probe_with(MockCommandRunner::new(), settings_for(&config));
        assert_eq!(probe.validate_config_syntax().await, SyntaxCheck::valid());
    }

    #[tokio::test]
    async fn test_syntax_check_failure_reports_stderr() {
        let config = NamedTempFile::new().unwrap();
        let binary = NamedTempFile::new().unwrap();
        let settings = OpenVpnSettings {
            binary_candidates: vec!["/nonexistent/openvpn".into(), binary.path().to_path_buf()],
            ..settings_for(&config)
        };

        let expected_program = binary.path().to_string_lossy().to_string();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |spec| spec.program == expected_program && spec.args.last().map(String::as_str) == Some("--test-crypto"))
            .returning(|_| Ok(CommandOutput::failed(1, "Options error: --local fails with ''\n")));

        let check = probe_with(runner, settings).validate_config_syntax().await;
        assert!(!check.valid);
        assert_eq!(check.error.as_deref(), Some("Options error: --local fails with ''"));
    }

    #[tokio::test]
    async fn test_service_logs_command() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "journalctl" && spec.args == ["-u", "openvpn-server@server", "-n", "50", "--no-pager"])
            .returning(|_| Ok(CommandOutput::ok("line one\nline two\n")));

        let logs = probe_with(runner, OpenVpnSettings::default()).get_service_logs(50).await.unwrap();
        assert_eq!(logs.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_restart_failure() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.args[0] == "restart")
            .returning(|_| Ok(CommandOutput::failed(1, "Job failed")));

        assert!(!probe_with(runner, OpenVpnSettings::default()).restart_service().await);
    }
}
