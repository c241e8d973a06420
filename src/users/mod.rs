//! Tunnel user lifecycle
//!
//! Users are created and revoked by driving the interactive installer
//! script; this module owns the dialogues and the files they leave behind
//! (certificate, `.ovpn` profile).

pub mod add_client;
pub mod profile;
pub mod revoke_client;

pub use add_client::{AddReport, AddState, AddTimeouts};
pub use profile::{ProfileValidator, RemoteAddressValidator};
pub use revoke_client::{DeleteOutcome, RevokeTimeouts};

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::InstallerSettings;
use crate::error::{NodeError, NodeResult};
use crate::openvpn::ConfigEditor;
use crate::session::{spawn_pty, InteractiveSession};
use crate::validation::validate_user_name;

/// Starts one installer session
#[async_trait]
pub trait InstallerLauncher: Send + Sync {
    async fn launch(&self) -> NodeResult<InteractiveSession>;
}

/// Runs the installer script on a pseudo-terminal with a minimal
/// environment
pub struct PtyLauncher {
    settings: InstallerSettings,
}

impl PtyLauncher {
    pub fn new(settings: InstallerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl InstallerLauncher for PtyLauncher {
    async fn launch(&self) -> NodeResult<InteractiveSession> {
        let script = &self.settings.script_path;
        if tokio::fs::metadata(script).await.is_err() {
            error!("Installer script not found at {}", script.display());
            return Err(NodeError::EnvironmentUnavailable(format!(
                "installer script not found: {}",
                script.display()
            )));
        }

        let args = [script.to_string_lossy().to_string()];
        Ok(spawn_pty(&self.settings.shell, &args, &self.settings.env)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    /// Certificate and profile were already there
    AlreadyExists,
}

pub struct UserManager {
    settings: InstallerSettings,
    launcher: Arc<dyn InstallerLauncher>,
    editor: Arc<ConfigEditor>,
    validator: Option<Arc<dyn ProfileValidator>>,
    /// One installer dialogue at a time
    installer_lock: Mutex<()>,
}

impl UserManager {
    pub fn new(
        settings: InstallerSettings,
        launcher: Arc<dyn InstallerLauncher>,
        editor: Arc<ConfigEditor>,
        validator: Option<Arc<dyn ProfileValidator>>,
    ) -> Self {
        Self {
            settings,
            launcher,
            editor,
            validator,
            installer_lock: Mutex::new(()),
        }
    }

    pub fn profile_path(&self, name: &str) -> PathBuf {
        profile::profile_path(&self.settings.profile_dir, name)
    }

    fn certificate_path(&self, name: &str) -> PathBuf {
        profile::certificate_path(&self.settings.pki_issued_dir, name)
    }

    fn add_timeouts(&self) -> AddTimeouts {
        AddTimeouts {
            menu: Duration::from_secs(self.settings.menu_timeout_secs),
            name_prompt: Duration::from_secs(self.settings.name_prompt_timeout_secs),
            completion: Duration::from_secs(self.settings.completion_timeout_secs),
            drain: Duration::from_secs(self.settings.drain_timeout_secs),
        }
    }

    fn revoke_timeouts(&self) -> RevokeTimeouts {
        RevokeTimeouts {
            step: Duration::from_secs(self.settings.revoke_step_timeout_secs),
            finish: Duration::from_secs(self.settings.revoke_finish_timeout_secs),
        }
    }

    /// Server config and template repairs run before every add, since
    /// the installer copies their content into the new profile. Failures
    /// are only logged.
    async fn repair_before_add(&self) {
        match self.editor.fix_server_config().await {
            Ok(repaired) if !repaired.is_empty() => info!("Repaired server config: {:?}", repaired),
            Ok(_) => {}
            Err(e) => warn!("Server config repair failed: {}", e),
        }
        if let Err(e) = self.editor.fix_template().await {
            warn!("Client template repair failed: {}", e);
        }
    }

    async fn validate_profile(&self, name: &str) {
        if let Some(validator) = &self.validator {
            let path = self.profile_path(name);
            if let Err(e) = validator.validate(&path).await {
                warn!("Profile check for '{}' failed: {}", name, e);
            }
        }
    }

    /// Create a tunnel user through the installer
    pub async fn create_user(&self, name: &str) -> NodeResult<CreateOutcome> {
        let name = validate_user_name(name)?;
        let _guard = self.installer_lock.lock().await;

        if self.certificate_path(&name).exists() {
            warn!("User '{}' already exists", name);
            if self.profile_path(&name).exists() {
                info!("User '{}' already exists with valid .ovpn file", name);
                return Ok(CreateOutcome::AlreadyExists);
            }
            error!("User '{}' exists but .ovpn file is missing", name);
            return Err(NodeError::Inconsistent(format!(
                "certificate for '{}' exists but its profile is missing",
                name
            )));
        }

        self.repair_before_add().await;

        let mut session = self.launcher.launch().await?;
        let report = match add_client::run_add_client(
            &mut session,
            &name,
            &self.add_timeouts(),
            self.settings.max_name_attempts,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                error!("Installer dialogue for '{}' failed: {}", name, e);
                session.close(true).await;
                return Err(e);
            }
        };

        match report.state {
            AddState::Finished => {
                session.close(false).await;
            }
            AddState::Rejected => {
                session.close(true).await;
                return Err(NodeError::Validation(format!(
                    "installer rejected user name '{}'",
                    name
                )));
            }
            AddState::Exhausted => {
                session.close(true).await;
                return Err(NodeError::timeout(
                    format!("installer completion for '{}'", name),
                    self.add_timeouts().completion * report.completion_waits,
                ));
            }
            other => {
                session.close(true).await;
                return Err(NodeError::ProcessExited(format!(
                    "installer dialogue ended in state {:?}",
                    other
                )));
            }
        }

        let profile = self.profile_path(&name);
        if report.banner_seen && !profile.exists() {
            error!("Installer reported success but {} is missing", profile.display());
            return Err(NodeError::NotFound(format!("{}", profile.display())));
        }
        if profile.exists() {
            self.validate_profile(&name).await;
        }

        info!("User '{}' created", name);
        Ok(CreateOutcome::Created)
    }

    /// Revoke a tunnel user and remove its local profile
    pub async fn delete_user(&self, name: &str) -> NodeResult<DeleteOutcome> {
        let name = validate_user_name(name)?;

        let _guard = self.installer_lock.lock().await;
        let mut session = self.launcher.launch().await?;
        let outcome = match revoke_client::run_revoke_client(&mut session, &name, &self.revoke_timeouts()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Error in delete dialogue for '{}': {}", name, e);
                session.close(true).await;
                return Err(e);
            }
        };

        match outcome {
            DeleteOutcome::NotFound => {
                session.close(true).await;
            }
            DeleteOutcome::Deleted => {
                session.close(false).await;
                let profile = self.profile_path(&name);
                match tokio::fs::remove_file(&profile).await {
                    Ok(()) => info!("Removed {}", profile.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => error!("Error deleting file {}: {}", profile.display(), e),
                }
            }
        }

        Ok(outcome)
    }

    /// Path of the user's profile, creating the user once if it is missing
    pub async fn download_profile(&self, name: &str) -> NodeResult<PathBuf> {
        let name = validate_user_name(name)?;
        let path = self.profile_path(&name);

        if path.exists() {
            self.validate_profile(&name).await;
            return Ok(path);
        }

        if let Err(e) = self.create_user(&name).await {
            error!("Failed to create user '{}' for download: {}", name, e);
        }

        if path.exists() {
            Ok(path)
        } else {
            error!("Failed to create or find OVPN file for {}", name);
            Err(NodeError::NotFound(format!("profile for '{}'", name)))
        }
    }
}
