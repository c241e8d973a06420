//! Periodic health check task
//!
//! Runs [`HealthMonitor::run_cycle`] every interval until stopped. Each
//! cycle runs in its own task so a panic inside one is logged and the loop
//! carries on.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{error, info};

use super::{CycleRecord, HealthMonitor};
use crate::error::{NodeError, NodeResult};

pub struct BackgroundMonitor {
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    /// Completed cycles
    event_tx: broadcast::Sender<CycleRecord>,
    /// Running flag
    running: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl BackgroundMonitor {
    pub fn new(monitor: Arc<HealthMonitor>, interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            monitor,
            interval,
            event_tx,
            running: Arc::new(RwLock::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to completed cycles
    pub fn subscribe(&self) -> broadcast::Receiver<CycleRecord> {
        self.event_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start the periodic loop. The first check runs immediately.
    pub async fn start(&self) -> NodeResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(NodeError::Inconsistent("Health monitor already running".to_string()));
        }
        *running = true;
        drop(running);

        info!("Starting OpenVPN health monitor (every {:?})", self.interval);

        let monitor = self.monitor.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let wake = self.wake.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            Self::monitor_loop(monitor, interval, event_tx, running, wake).await;
        });

        Ok(())
    }

    /// Stop after the cycle in progress, if any
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();
        info!("Stopped OpenVPN health monitor");
    }

    async fn monitor_loop(
        monitor: Arc<HealthMonitor>,
        interval: Duration,
        event_tx: broadcast::Sender<CycleRecord>,
        running: Arc<RwLock<bool>>,
        wake: Arc<Notify>,
    ) {
        while *running.read().await {
            let cycle_monitor = monitor.clone();
            match tokio::spawn(async move { cycle_monitor.run_cycle().await }).await {
                Ok(record) => {
                    // No subscribers is fine
                    let _ = event_tx.send(record);
                }
                Err(e) => error!("Error in periodic health check: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandTimeouts, MonitorSettings, OpenVpnSettings};
    use crate::exec::{CommandOutput, CommandSpec};
    use crate::openvpn::{ConfigEditor, ServiceProbe};
    use crate::testing::{FixedAddress, ScriptedRunner};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor_with(runner: ScriptedRunner) -> Arc<HealthMonitor> {
        let settings = OpenVpnSettings {
            config_file: "/nonexistent/server.conf".into(),
            binary_candidates: Vec::new(),
            ..OpenVpnSettings::default()
        };
        let runner = Arc::new(runner);
        let probe = Arc::new(ServiceProbe::new(
            runner.clone(),
            settings.clone(),
            CommandTimeouts::default(),
            Duration::ZERO,
        ));
        let editor = Arc::new(ConfigEditor::new(
            settings,
            runner,
            Arc::new(FixedAddress(None)),
            Duration::from_secs(1),
        ));
        let monitor_settings = MonitorSettings {
            verify_delay_secs: 0,
            ..MonitorSettings::default()
        };
        Arc::new(HealthMonitor::new(probe, editor, monitor_settings))
    }

    #[tokio::test]
    async fn test_loop_runs_cycles_and_stops() {
        let runner = ScriptedRunner::new().on("ss -ulnp", CommandOutput::ok("0.0.0.0:1194"));
        let background = BackgroundMonitor::new(monitor_with(runner), Duration::from_millis(10));
        let mut events = background.subscribe();

        background.start().await.unwrap();
        assert!(background.start().await.is_err());

        for _ in 0..2 {
            let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(record.healthy);
        }

        background.stop().await;
        assert!(!background.is_running().await);
    }

    #[tokio::test]
    async fn test_loop_survives_panicking_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let runner = ScriptedRunner::new().on_fn(move |spec: &CommandSpec| {
            if spec.display().starts_with("systemctl is-active") && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("probe blew up");
            }
            None
        });
        let background = BackgroundMonitor::new(monitor_with(runner), Duration::from_millis(10));
        let mut events = background.subscribe();

        background.start().await.unwrap();
        let record = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();

        // The first cycle panicked; this one came after it
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(record.fix.is_some());
        background.stop().await;
    }
}
