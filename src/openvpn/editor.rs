//! Config inspector and editor
//!
//! Detects defects in the server configuration (from the journal and from
//! the file itself) and repairs them in place. Every edit is a whole-file
//! read, transform and write, serialised per file by an async mutex.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::address::{host_ipv4_addresses, PublicAddressResolver};
use super::directives::{self, Remote};
use crate::config::OpenVpnSettings;
use crate::error::{NodeError, NodeResult};
use crate::exec::CommandRunner;
use crate::validation::{validate_hostname, validate_port, validate_protocol};

/// Defect categories. Serialized names match the identifiers API clients
/// already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefectKind {
    #[serde(rename = "missing_local_ip")]
    MissingLocalAddress,
    #[serde(rename = "unrecognized_option")]
    UnrecognizedOption,
    #[serde(rename = "port_binding")]
    PortBindingFailure,
    #[serde(rename = "missing_port")]
    MissingPort,
    #[serde(rename = "missing_protocol")]
    MissingProtocol,
    #[serde(rename = "missing_device_mode")]
    MissingDeviceMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
}

/// One detected configuration problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDefect {
    #[serde(rename = "type")]
    pub kind: DefectKind,
    pub severity: Severity,
    pub message: String,
    /// Journal line the defect was read from
    #[serde(rename = "log", skip_serializing_if = "Option::is_none", default)]
    pub evidence: Option<String>,
}

impl ConfigDefect {
    fn critical(kind: DefectKind, message: &str, evidence: Option<&str>) -> Self {
        Self {
            kind,
            severity: Severity::Critical,
            message: message.to_string(),
            evidence: evidence.map(str::to_string),
        }
    }
}

/// Scan journal output for known failure signatures. One line may yield
/// more than one defect.
pub fn detect_config_errors(logs: &str) -> Vec<ConfigDefect> {
    let mut defects = Vec::new();

    for line in logs.lines() {
        if line.contains("Options error") && line.contains("local") {
            defects.push(ConfigDefect::critical(
                DefectKind::MissingLocalAddress,
                "Missing IP address in 'local' directive",
                Some(line),
            ));
        }

        if line.contains("Unrecognized option") {
            defects.push(ConfigDefect::critical(
                DefectKind::UnrecognizedOption,
                "Configuration contains unrecognized options",
                Some(line),
            ));
        }

        let lower = line.to_lowercase();
        if lower.contains("bind") && lower.contains("failed") {
            defects.push(ConfigDefect::critical(
                DefectKind::PortBindingFailure,
                "Failed to bind to port",
                Some(line),
            ));
        }
    }

    defects
}

/// Static checks of the server configuration text
pub fn inspect_server_config(text: &str) -> Vec<ConfigDefect> {
    let mut defects = Vec::new();

    if directives::has_empty(text, directives::LOCAL) {
        defects.push(ConfigDefect::critical(
            DefectKind::MissingLocalAddress,
            "Missing IP address in 'local' directive",
            None,
        ));
    }

    let required = [
        (directives::PORT, DefectKind::MissingPort, "No 'port' directive value"),
        (directives::PROTO, DefectKind::MissingProtocol, "No 'proto' directive value"),
        (directives::DEV, DefectKind::MissingDeviceMode, "No 'dev' directive value"),
    ];
    for (keyword, kind, message) in required {
        if directives::state(text, keyword).is_missing() {
            defects.push(ConfigDefect::critical(kind, message, None));
        }
    }

    defects
}

/// Fill `remote` lines that lack a usable host with `address`.
///
/// With `replace_invalid`, hosts that are present but not a valid hostname
/// or IP are replaced as well. A missing port falls back to `default_port`.
pub fn fill_remote_host(text: &str, address: &str, default_port: u16, replace_invalid: bool) -> Option<String> {
    directives::rewrite_remote(text, |remote: &Remote| {
        let needs_host = match &remote.host {
            None => true,
            Some(host) => replace_invalid && validate_hostname(host).is_err(),
        };
        needs_host.then(|| (address.to_string(), remote.port.unwrap_or(default_port)))
    })
}

/// True when some `remote` line lacks a usable host
pub fn remote_needs_host(text: &str, replace_invalid: bool) -> bool {
    fill_remote_host(text, "0.0.0.0", 1, replace_invalid).is_some()
}

/// Port, protocol and public address applied by [`ConfigEditor::apply_settings`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default)]
    pub tunnel_address: Option<String>,
    pub protocol: String,
    pub port: u32,
}

impl TunnelSettings {
    /// Normalized (address, protocol, port), or a validation error
    pub fn validate(&self) -> NodeResult<(Option<String>, String, u16)> {
        let protocol = validate_protocol(&self.protocol)?;
        let port = validate_port(self.port)?;
        let address = match self.tunnel_address.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => {
                validate_hostname(addr)?;
                Some(addr.to_string())
            }
            _ => None,
        };
        Ok((address, protocol, port))
    }
}

pub struct ConfigEditor {
    settings: OpenVpnSettings,
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn PublicAddressResolver>,
    interface_timeout: Duration,
    config_lock: Mutex<()>,
    template_lock: Mutex<()>,
}

impl ConfigEditor {
    pub fn new(
        settings: OpenVpnSettings,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn PublicAddressResolver>,
        interface_timeout: Duration,
    ) -> Self {
        Self {
            settings,
            runner,
            resolver,
            interface_timeout,
            config_lock: Mutex::new(()),
            template_lock: Mutex::new(()),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.settings.config_file
    }

    pub fn template_file(&self) -> &Path {
        &self.settings.template_file
    }

    /// Static inspection of the server config file
    pub async fn inspect_server_config(&self) -> NodeResult<Vec<ConfigDefect>> {
        let text = read_managed(&self.settings.config_file).await?;
        Ok(inspect_server_config(&text))
    }

    async fn local_address(&self) -> Option<String> {
        let ips = host_ipv4_addresses(
            self.runner.as_ref(),
            &self.settings.tunnel_subnet_prefix,
            self.interface_timeout,
        )
        .await;
        ips.into_iter().next()
    }

    /// Fill an empty `local` directive with `address`, if one is given
    fn local_pass(&self, text: &str, address: Option<&str>) -> Option<String> {
        let address = match address {
            Some(a) => a,
            None => {
                error!("No valid IP addresses found on server");
                return None;
            }
        };
        info!("Selected IP address for 'local': {}", address);
        directives::fill_empty(text, directives::LOCAL, address)
    }

    /// Repair only the `local` directive. Returns true iff the file changed.
    pub async fn fix_missing_local_address(&self) -> NodeResult<bool> {
        let _guard = self.config_lock.lock().await;
        let text = read_managed(&self.settings.config_file).await?;

        if !directives::has_empty(&text, directives::LOCAL) {
            return Ok(false);
        }
        warn!("Detected 'local' directive without IP address");

        let address = self.local_address().await;
        match self.local_pass(&text, address.as_deref()) {
            Some(updated) => {
                write_managed(&self.settings.config_file, &updated).await?;
                info!("Fixed 'local' directive in {}", self.settings.config_file.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Idempotent repair of `local`, `port`, `proto` and `dev`. Valid values
    /// are never overwritten and the file is written at most once. Returns
    /// the directives that were repaired.
    pub async fn fix_server_config(&self) -> NodeResult<Vec<&'static str>> {
        let _guard = self.config_lock.lock().await;
        let original = read_managed(&self.settings.config_file).await?;
        let mut text = original.clone();
        let mut repaired = Vec::new();

        if directives::has_empty(&text, directives::LOCAL) {
            let address = self.local_address().await;
            if let Some(updated) = self.local_pass(&text, address.as_deref()) {
                text = updated;
                repaired.push(directives::LOCAL);
            }
        }

        let port = self.settings.default_port.to_string();
        let defaults = [
            (directives::PORT, port.as_str()),
            (directives::PROTO, self.settings.default_proto.as_str()),
            (directives::DEV, self.settings.default_dev.as_str()),
        ];
        for (keyword, value) in defaults {
            if let Some(updated) = directives::ensure(&text, keyword, value) {
                info!("Setting missing '{}' to {}", keyword, value);
                text = updated;
                repaired.push(keyword);
            }
        }

        if text != original {
            write_managed(&self.settings.config_file, &text).await?;
        } else {
            debug!("{} needs no repair", self.settings.config_file.display());
        }
        Ok(repaired)
    }

    /// Give an address-less `remote` line in the client template the host's
    /// public address. Returns true iff the template changed.
    pub async fn fix_template(&self) -> NodeResult<bool> {
        let _guard = self.template_lock.lock().await;
        let text = read_managed(&self.settings.template_file).await?;

        if !remote_needs_host(&text, false) {
            return Ok(false);
        }

        let address = self.resolver.resolve().await.ok_or_else(|| {
            NodeError::EnvironmentUnavailable("public address could not be resolved".to_string())
        })?;

        match fill_remote_host(&text, &address.to_string(), self.settings.default_port, false) {
            Some(updated) => {
                write_managed(&self.settings.template_file, &updated).await?;
                info!("Template 'remote' set to {}", address);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write port and protocol to the server config, and the remote
    /// target and protocol to the client template. Directives that are
    /// absent get appended. Nothing is rolled back on failure.
    pub async fn apply_settings(&self, change: &TunnelSettings) -> NodeResult<()> {
        let (address, protocol, port) = change.validate()?;
        let port_str = port.to_string();

        {
            let _guard = self.config_lock.lock().await;
            let text = read_managed(&self.settings.config_file).await?;
            let text = directives::set(&text, directives::PORT, &port_str);
            let text = directives::set(&text, directives::PROTO, &protocol);
            write_managed(&self.settings.config_file, &text).await?;
        }

        {
            let _guard = self.template_lock.lock().await;
            let text = read_managed(&self.settings.template_file).await?;
            let text = match &address {
                Some(addr) => {
                    if directives::remote(&text).is_some() {
                        directives::rewrite_remote(&text, |_| Some((addr.clone(), port))).unwrap_or(text)
                    } else {
                        directives::set(&text, directives::REMOTE, &format!("{} {}", addr, port))
                    }
                }
                None => directives::rewrite_remote(&text, |remote| {
                    remote.host.clone().map(|host| (host, port))
                })
                .unwrap_or(text),
            };
            let text = directives::set(&text, directives::PROTO, &protocol);
            write_managed(&self.settings.template_file, &text).await?;
        }

        info!(
            "OpenVPN port changed to {}, protocol to {}, tunnel address to {}",
            port,
            protocol,
            address.as_deref().unwrap_or("(unchanged)")
        );
        Ok(())
    }
}

async fn read_managed(path: &Path) -> NodeResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!("Config file not found: {}", path.display());
            Err(NodeError::NotFound(format!("{}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_managed(path: &Path, text: &str) -> NodeResult<()> {
    tokio::fs::write(path, text).await?;
    Ok(())
}
