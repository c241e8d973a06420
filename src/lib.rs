//! ovnode - OpenVPN gateway node agent
//!
//! Async library behind the `ovnoded` daemon and the `ovctl` CLI:
//! - Service probing (systemd, socket table, journal, syntax self-test)
//! - Server config and client template inspection and repair
//! - Health checks with automatic repair and restart
//! - Tunnel user management through the interactive installer
//! - HTTP management API

pub mod error;
pub mod config;
pub mod validation;
pub mod exec;
pub mod session;
pub mod openvpn;
pub mod monitor;
pub mod users;
pub mod node;
pub mod api;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use error::{NodeError, NodeResult};
pub use config::NodeConfig;
pub use exec::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use session::{InteractiveSession, Pattern, SessionError};
pub use openvpn::{
    ConfigDefect, ConfigEditor, DefectKind, ServiceProbe, ServiceStatus, TunnelSettings,
};
pub use monitor::{AutoFixResult, BackgroundMonitor, CycleRecord, HealthMonitor, HealthReport};
pub use users::{CreateOutcome, DeleteOutcome, UserManager};
pub use node::Node;
