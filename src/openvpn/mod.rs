//! OpenVPN server management
//!
//! Everything the node knows about the managed `openvpn-server@server`
//! unit and its files:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ ServiceProbe │   │ ConfigEditor │   │   address    │
//! │ systemd, ss, │   │ inspect and  │──▶│ ip addr and  │
//! │ journal      │   │ repair files │   │ public IPv4  │
//! └──────────────┘   └──────┬───────┘   └──────────────┘
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │  directives  │  <- every line pattern
//!                    └──────────────┘
//! ```

pub mod address;
pub mod directives;
pub mod editor;
pub mod probe;

pub use address::{HttpAddressResolver, PublicAddressResolver};
pub use editor::{ConfigDefect, ConfigEditor, DefectKind, Severity, TunnelSettings};
pub use probe::{ServiceProbe, ServiceStatus, SyntaxCheck};
