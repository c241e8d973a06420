//! Health checks and self-healing for the OpenVPN service
//!
//! [`HealthMonitor::health_check`] answers "is the tunnel usable right
//! now"; [`HealthMonitor::auto_fix_and_restart`] runs one repair round
//! (detect, patch, enable, restart, verify). [`background`] wraps both in
//! a periodic task.

pub mod background;

pub use background::BackgroundMonitor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::MonitorSettings;
use crate::openvpn::editor::detect_config_errors;
use crate::openvpn::{ConfigDefect, ConfigEditor, DefectKind, ServiceProbe};

pub const FIX_LOCAL_ADDRESS: &str = "fixed_missing_local_ip";
pub const FIX_ENABLED: &str = "enabled_service";
pub const FIX_RESTARTED: &str = "restarted_service";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub service_running: bool,
    pub port_listening: bool,
    pub config_valid: bool,
    pub issues: Vec<String>,
}

impl HealthReport {
    /// Build a report; `healthy` is derived, never set directly
    pub fn new(service_running: bool, port_listening: bool, config_valid: bool, issues: Vec<String>) -> Self {
        Self {
            healthy: service_running && port_listening && config_valid,
            service_running,
            port_listening,
            config_valid,
            issues,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFixResult {
    pub success: bool,
    pub errors_detected: Vec<ConfigDefect>,
    /// Fix identifiers in the order they were applied
    pub fixes_applied: Vec<String>,
    pub service_running: bool,
    pub port_open: bool,
}

/// Outcome of one background cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub fix: Option<AutoFixResult>,
}

pub struct HealthMonitor {
    probe: Arc<ServiceProbe>,
    editor: Arc<ConfigEditor>,
    settings: MonitorSettings,
    last_cycle: RwLock<Option<CycleRecord>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<ServiceProbe>, editor: Arc<ConfigEditor>, settings: MonitorSettings) -> Self {
        Self {
            probe,
            editor,
            settings,
            last_cycle: RwLock::new(None),
        }
    }

    /// Defects found in the recent journal. An unreadable journal yields
    /// no defects.
    pub async fn detect_config_errors(&self) -> Vec<ConfigDefect> {
        match self.probe.get_service_logs(self.settings.log_lines).await {
            Ok(logs) => detect_config_errors(&logs),
            Err(e) => {
                error!("Error getting service logs: {}", e);
                Vec::new()
            }
        }
    }

    /// Journal defects followed by defects found in the server config file.
    /// A file defect whose kind the journal already reported is left out.
    pub async fn config_defects(&self) -> Vec<ConfigDefect> {
        let mut defects = self.detect_config_errors().await;

        match self.editor.inspect_server_config().await {
            Ok(found) => {
                for defect in found {
                    if !defects.iter().any(|d| d.kind == defect.kind) {
                        defects.push(defect);
                    }
                }
            }
            Err(e) => error!("Error inspecting server config: {}", e),
        }

        defects
    }

    pub async fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();

        let status = self.probe.check_service_status().await;
        if !status.running {
            issues.push("Service is not running".to_string());
        }
        if !status.enabled {
            issues.push("Service is not enabled on boot".to_string());
        }

        let (port, protocol) = self.probe.get_config_port_protocol().await;
        let port_listening = self.probe.check_port_listening(port, &protocol).await;
        if !port_listening {
            issues.push(format!("Port {}/{} is not listening", port, protocol));
        }

        let syntax = self.probe.validate_config_syntax().await;
        if !syntax.valid {
            issues.push(format!(
                "Config validation failed: {}",
                syntax.error.as_deref().unwrap_or("unknown error")
            ));
        }

        HealthReport::new(status.running, port_listening, syntax.valid, issues)
    }

    /// One repair round: detect, patch, enable, restart, verify.
    pub async fn auto_fix_and_restart(&self) -> AutoFixResult {
        let mut result = AutoFixResult::default();
        info!("Starting OpenVPN auto-fix procedure");

        let status = self.probe.check_service_status().await;
        info!("Current service status: {:?}", status);

        result.errors_detected = self.detect_config_errors().await;
        if !result.errors_detected.is_empty() {
            warn!("Detected {} configuration errors", result.errors_detected.len());
        }

        let local_defects = result
            .errors_detected
            .iter()
            .filter(|d| d.kind == DefectKind::MissingLocalAddress)
            .count();
        for _ in 0..local_defects {
            match self.editor.fix_missing_local_address().await {
                Ok(true) => {
                    info!("Fixed missing local IP");
                    result.fixes_applied.push(FIX_LOCAL_ADDRESS.to_string());
                }
                Ok(false) => {}
                Err(e) => error!("Error fixing missing local IP: {}", e),
            }
        }

        if !status.enabled && self.probe.enable_service().await {
            result.fixes_applied.push(FIX_ENABLED.to_string());
        }

        if !self.probe.restart_service().await {
            error!("Failed to restart service");
            return result;
        }
        result.fixes_applied.push(FIX_RESTARTED.to_string());

        tokio::time::sleep(Duration::from_secs(self.settings.verify_delay_secs)).await;
        result.service_running = self.probe.check_service_status().await.running;

        let (port, protocol) = self.probe.get_config_port_protocol().await;
        result.port_open = self.probe.check_port_listening(port, &protocol).await;
        result.success = result.service_running && result.port_open;

        if result.success {
            info!("OpenVPN service is now running correctly");
        } else {
            warn!("Service started but issues remain");
            if !result.port_open {
                warn!("Port {}/{} is not open", port, protocol);
            }
        }

        result
    }

    /// Health check followed by auto-fix when unhealthy
    pub async fn run_cycle(&self) -> CycleRecord {
        info!("Running periodic OpenVPN health check");
        let health = self.health_check().await;

        let fix = if health.healthy {
            info!("OpenVPN is healthy");
            None
        } else {
            warn!("OpenVPN is unhealthy: {:?}", health.issues);
            info!("Attempting auto-fix");
            let fix = self.auto_fix_and_restart().await;
            if fix.success {
                info!("Auto-fix successful, OpenVPN is now healthy");
            } else {
                error!("Auto-fix failed: {:?}", fix);
            }
            Some(fix)
        };

        let record = CycleRecord {
            checked_at: Utc::now(),
            healthy: health.healthy,
            issues: health.issues,
            fix,
        };
        self.record_cycle(record.clone()).await;
        record
    }

    pub async fn record_cycle(&self, record: CycleRecord) {
        *self.last_cycle.write().await = Some(record);
    }

    /// Most recent background cycle, if one has completed
    pub async fn last_cycle(&self) -> Option<CycleRecord> {
        self.last_cycle.read().await.clone()
    }
}
