//! Configuration management for ovnode

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use crate::error::{NodeError, NodeResult};

/// Default location of the node configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ovnode/ovnode.toml";

/// Main ovnode configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerSettings,
    pub openvpn: OpenVpnSettings,
    pub installer: InstallerSettings,
    pub monitor: MonitorSettings,
    pub public_address: PublicAddressSettings,
    pub timeouts: CommandTimeouts,
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen port
    #[serde(default = "default_service_port")]
    pub port: u16,
    /// Shared secret expected in the `key` header
    #[serde(default)]
    pub api_key: Option<String>,
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Managed OpenVPN service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenVpnSettings {
    /// systemd unit name
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Server configuration file
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    /// Client profile template
    #[serde(default = "default_template_file")]
    pub template_file: PathBuf,
    /// Places to look for the openvpn binary
    #[serde(default = "default_binary_candidates")]
    pub binary_candidates: Vec<PathBuf>,
    /// Address prefix of the tunnel subnet, never used as `local`
    #[serde(default = "default_tunnel_prefix")]
    pub tunnel_subnet_prefix: String,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_proto")]
    pub default_proto: String,
    #[serde(default = "default_dev")]
    pub default_dev: String,
}

/// Interactive installer used for user management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerSettings {
    /// Installer script
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,
    /// Shell used to run the script
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    /// Environment handed to the installer (it gets nothing else)
    #[serde(default = "default_installer_env")]
    pub env: BTreeMap<String, String>,
    /// Directory holding issued client certificates
    #[serde(default = "default_pki_issued_dir")]
    pub pki_issued_dir: PathBuf,
    /// Directory where the installer drops `<name>.ovpn`
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,
    /// Waits after the client name was sent before giving up
    #[serde(default = "default_name_attempts")]
    pub max_name_attempts: u32,
    #[serde(default = "default_menu_timeout")]
    pub menu_timeout_secs: u64,
    #[serde(default = "default_menu_timeout")]
    pub name_prompt_timeout_secs: u64,
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_revoke_step_timeout")]
    pub revoke_step_timeout_secs: u64,
    #[serde(default = "default_revoke_finish_timeout")]
    pub revoke_finish_timeout_secs: u64,
}

/// Background health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Journal lines scanned for configuration errors
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
    /// Pause right after a successful restart
    #[serde(default = "default_restart_settle")]
    pub restart_settle_secs: u64,
    /// Pause before re-probing after an auto-fix restart
    #[serde(default = "default_verify_delay")]
    pub verify_delay_secs: u64,
}

/// "What is my IP" lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAddressSettings {
    #[serde(default = "default_address_services")]
    pub services: Vec<String>,
    #[serde(default = "default_address_timeout")]
    pub timeout_secs: u64,
}

/// Per-command timeouts (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTimeouts {
    #[serde(default = "default_query_timeout")]
    pub systemctl_query: u64,
    #[serde(default = "default_enable_timeout")]
    pub systemctl_enable: u64,
    #[serde(default = "default_restart_timeout")]
    pub systemctl_restart: u64,
    #[serde(default = "default_enable_timeout")]
    pub journal: u64,
    #[serde(default = "default_query_timeout")]
    pub socket_query: u64,
    #[serde(default = "default_query_timeout")]
    pub interface_query: u64,
    #[serde(default = "default_enable_timeout")]
    pub syntax_check: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_service_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_service_name() -> String {
    "openvpn-server@server".to_string()
}

fn default_config_file() -> PathBuf {
    PathBuf::from("/etc/openvpn/server/server.conf")
}

fn default_template_file() -> PathBuf {
    PathBuf::from("/etc/openvpn/server/client-common.txt")
}

fn default_binary_candidates() -> Vec<PathBuf> {
    ["/usr/sbin/openvpn", "/usr/bin/openvpn", "/sbin/openvpn"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_tunnel_prefix() -> String {
    "10.8.".to_string()
}

fn default_port() -> u16 {
    1194
}

fn default_proto() -> String {
    "udp".to_string()
}

fn default_dev() -> String {
    "tun".to_string()
}

fn default_script_path() -> PathBuf {
    PathBuf::from("/root/openvpn-install.sh")
}

fn default_shell() -> PathBuf {
    PathBuf::from("/usr/bin/bash")
}

fn default_installer_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        "PATH".to_string(),
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
    );
    env
}

fn default_pki_issued_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/server/easy-rsa/pki/issued")
}

fn default_profile_dir() -> PathBuf {
    PathBuf::from("/root")
}

fn default_name_attempts() -> u32 {
    3
}

fn default_menu_timeout() -> u64 {
    90
}

fn default_completion_timeout() -> u64 {
    180
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_revoke_step_timeout() -> u64 {
    20
}

fn default_revoke_finish_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    300
}

fn default_log_lines() -> usize {
    50
}

fn default_restart_settle() -> u64 {
    2
}

fn default_verify_delay() -> u64 {
    3
}

fn default_address_services() -> Vec<String> {
    vec![
        "https://ifconfig.me/ip".to_string(),
        "https://icanhazip.com".to_string(),
        "https://api.ipify.org".to_string(),
    ]
}

fn default_address_timeout() -> u64 {
    10
}

fn default_query_timeout() -> u64 {
    5
}

fn default_enable_timeout() -> u64 {
    10
}

fn default_restart_timeout() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_service_port(),
            api_key: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for OpenVpnSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            config_file: default_config_file(),
            template_file: default_template_file(),
            binary_candidates: default_binary_candidates(),
            tunnel_subnet_prefix: default_tunnel_prefix(),
            default_port: default_port(),
            default_proto: default_proto(),
            default_dev: default_dev(),
        }
    }
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            script_path: default_script_path(),
            shell: default_shell(),
            env: default_installer_env(),
            pki_issued_dir: default_pki_issued_dir(),
            profile_dir: default_profile_dir(),
            max_name_attempts: default_name_attempts(),
            menu_timeout_secs: default_menu_timeout(),
            name_prompt_timeout_secs: default_menu_timeout(),
            completion_timeout_secs: default_completion_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            revoke_step_timeout_secs: default_revoke_step_timeout(),
            revoke_finish_timeout_secs: default_revoke_finish_timeout(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            log_lines: default_log_lines(),
            restart_settle_secs: default_restart_settle(),
            verify_delay_secs: default_verify_delay(),
        }
    }
}

impl Default for PublicAddressSettings {
    fn default() -> Self {
        Self {
            services: default_address_services(),
            timeout_secs: default_address_timeout(),
        }
    }
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            systemctl_query: default_query_timeout(),
            systemctl_enable: default_enable_timeout(),
            systemctl_restart: default_restart_timeout(),
            journal: default_enable_timeout(),
            socket_query: default_query_timeout(),
            interface_query: default_query_timeout(),
            syntax_check: default_enable_timeout(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NodeError::ConfigError(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| NodeError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load the file if it exists, fall back to defaults otherwise, then
    /// apply environment overrides
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Resolve the config path from an explicit argument, `OVNODE_CONFIG`,
    /// or the built-in default
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var("OVNODE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// `OVNODE_API_KEY` and `OVNODE_PORT` take precedence over the file
    pub fn apply_env_overrides(&mut self) -> NodeResult<()> {
        if let Ok(key) = std::env::var("OVNODE_API_KEY") {
            if !key.trim().is_empty() {
                self.server.api_key = Some(key);
            }
        }

        if let Ok(port) = std::env::var("OVNODE_PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                NodeError::ConfigError(format!("OVNODE_PORT is not a valid port: {}", port))
            })?;
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> NodeResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NodeError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| NodeError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}
