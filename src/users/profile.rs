//! Client profile checks
//!
//! The installer copies `remote` from the template when it writes a
//! profile, so a template that lacked an address produces profiles nobody
//! can connect with. Validators fix that after the fact.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{NodeError, NodeResult};
use crate::openvpn::editor::{fill_remote_host, remote_needs_host};
use crate::openvpn::PublicAddressResolver;

/// `<profile_dir>/<name>.ovpn`
pub fn profile_path(profile_dir: &Path, name: &str) -> PathBuf {
    profile_dir.join(format!("{}.ovpn", name))
}

/// `<pki_issued_dir>/<name>.crt`
pub fn certificate_path(pki_issued_dir: &Path, name: &str) -> PathBuf {
    pki_issued_dir.join(format!("{}.crt", name))
}

/// Checks, and where possible repairs, a freshly written profile
#[async_trait]
pub trait ProfileValidator: Send + Sync {
    /// Returns true iff the profile was rewritten
    async fn validate(&self, path: &Path) -> NodeResult<bool>;
}

/// Refills `remote` lines whose host is missing or malformed with the
/// host's public address.
pub struct RemoteAddressValidator {
    resolver: Arc<dyn PublicAddressResolver>,
    default_port: u16,
}

impl RemoteAddressValidator {
    pub fn new(resolver: Arc<dyn PublicAddressResolver>, default_port: u16) -> Self {
        Self { resolver, default_port }
    }
}

#[async_trait]
impl ProfileValidator for RemoteAddressValidator {
    async fn validate(&self, path: &Path) -> NodeResult<bool> {
        let text = tokio::fs::read_to_string(path).await?;
        if !remote_needs_host(&text, true) {
            return Ok(false);
        }

        warn!("Profile {} has no usable remote address", path.display());
        let address = self.resolver.resolve().await.ok_or_else(|| {
            NodeError::EnvironmentUnavailable("public address could not be resolved".to_string())
        })?;

        match fill_remote_host(&text, &address.to_string(), self.default_port, true) {
            Some(updated) => {
                tokio::fs::write(path, updated).await?;
                info!("Set remote address {} in {}", address, path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedAddress;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn validator(public: Option<Ipv4Addr>) -> RemoteAddressValidator {
        RemoteAddressValidator::new(Arc::new(FixedAddress(public)), 1194)
    }

    #[test]
    fn test_paths() {
        assert_eq!(profile_path(Path::new("/root"), "alice"), PathBuf::from("/root/alice.ovpn"));
        assert_eq!(
            certificate_path(Path::new("/etc/openvpn/server/easy-rsa/pki/issued"), "alice"),
            PathBuf::from("/etc/openvpn/server/easy-rsa/pki/issued/alice.crt")
        );
    }

    #[tokio::test]
    async fn test_repairs_profile_without_address() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alice.ovpn");
        std::fs::write(&path, "client\nremote  1194\n<ca>\nMIIBszCCAVmgAwIBAgIU\n</ca>\n").unwrap();

        let repaired = validator(Some(Ipv4Addr::new(203, 0, 113, 7))).validate(&path).await.unwrap();
        assert!(repaired);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("client\nremote 203.0.113.7 1194\n"));
    }

    #[tokio::test]
    async fn test_valid_profile_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bob.ovpn");
        let profile = "client\nremote vpn.example.com 443\n";
        std::fs::write(&path, profile).unwrap();

        assert!(!validator(None).validate(&path).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), profile);
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("carol.ovpn");
        std::fs::write(&path, "remote 1194\n").unwrap();

        assert!(matches!(
            validator(None).validate(&path).await,
            Err(NodeError::EnvironmentUnavailable(_))
        ));
    }
}
