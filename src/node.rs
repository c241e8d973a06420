//! Node context
//!
//! One explicitly constructed handle owning every component of the agent.
//! Binaries build it once from [`NodeConfig`] and share it behind an `Arc`.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::exec::{CommandRunner, SystemRunner};
use crate::monitor::{BackgroundMonitor, HealthMonitor};
use crate::openvpn::{ConfigEditor, HttpAddressResolver, PublicAddressResolver, ServiceProbe, TunnelSettings};
use crate::users::{InstallerLauncher, ProfileValidator, PtyLauncher, RemoteAddressValidator, UserManager};

pub struct Node {
    config: NodeConfig,
    probe: Arc<ServiceProbe>,
    editor: Arc<ConfigEditor>,
    monitor: Arc<HealthMonitor>,
    background: Arc<BackgroundMonitor>,
    users: Arc<UserManager>,
}

impl Node {
    /// Build a node talking to the real system
    pub fn new(config: NodeConfig) -> NodeResult<Self> {
        let resolver = Arc::new(HttpAddressResolver::new(&config.public_address)?);
        let launcher = Arc::new(PtyLauncher::new(config.installer.clone()));
        Ok(Self::with_parts(config, Arc::new(SystemRunner), resolver, launcher))
    }

    /// Build a node over caller-supplied process and network seams
    pub fn with_parts(
        config: NodeConfig,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn PublicAddressResolver>,
        launcher: Arc<dyn InstallerLauncher>,
    ) -> Self {
        let probe = Arc::new(ServiceProbe::new(
            runner.clone(),
            config.openvpn.clone(),
            config.timeouts.clone(),
            Duration::from_secs(config.monitor.restart_settle_secs),
        ));
        let editor = Arc::new(ConfigEditor::new(
            config.openvpn.clone(),
            runner,
            resolver.clone(),
            Duration::from_secs(config.timeouts.interface_query),
        ));
        let monitor = Arc::new(HealthMonitor::new(probe.clone(), editor.clone(), config.monitor.clone()));
        let background = Arc::new(BackgroundMonitor::new(
            monitor.clone(),
            Duration::from_secs(config.monitor.interval_secs),
        ));
        let validator: Arc<dyn ProfileValidator> =
            Arc::new(RemoteAddressValidator::new(resolver, config.openvpn.default_port));
        let users = Arc::new(UserManager::new(
            config.installer.clone(),
            launcher,
            editor.clone(),
            Some(validator),
        ));

        Self {
            config,
            probe,
            editor,
            monitor,
            background,
            users,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn probe(&self) -> &Arc<ServiceProbe> {
        &self.probe
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn background(&self) -> &Arc<BackgroundMonitor> {
        &self.background
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    /// Apply new tunnel settings and restart the service. Edits already
    /// written stay in place when a later step fails.
    pub async fn change_config(&self, change: &TunnelSettings) -> NodeResult<()> {
        self.editor.apply_settings(change).await.map_err(|e| {
            error!("Failed to apply settings: {}", e);
            e
        })?;

        if !self.probe.restart_service().await {
            return Err(NodeError::CommandFailed {
                cmd: format!("systemctl restart {}", self.probe.service_name()),
                code: None,
                stderr: "service did not restart after settings change".to_string(),
            });
        }

        info!("Settings applied: port {} proto {}", change.port, change.protocol);
        Ok(())
    }
}
