//! Host address discovery
//!
//! Two sources: the host's own interfaces (for the server's `local`
//! directive) and public "what is my IP" services (for the `remote` line
//! handed to clients).

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::directives;
use crate::config::PublicAddressSettings;
use crate::error::{NodeError, NodeResult};
use crate::exec::{CommandRunner, CommandSpec};
use crate::validation::parse_strict_ipv4;

/// Keep interface addresses usable as the server's bind address: drop
/// loopback and the tunnel's own subnet.
pub fn usable_local_addresses(addresses: Vec<String>, tunnel_prefix: &str) -> Vec<String> {
    addresses
        .into_iter()
        .filter(|ip| !ip.starts_with("127.") && !ip.starts_with(tunnel_prefix))
        .collect()
}

/// IPv4 addresses of the host, in `ip addr show` order, minus loopback
/// and tunnel addresses. Failures yield an empty list.
pub async fn host_ipv4_addresses(
    runner: &dyn CommandRunner,
    tunnel_prefix: &str,
    timeout: Duration,
) -> Vec<String> {
    let spec = CommandSpec::new("ip", ["addr", "show"], timeout);
    match runner.run(spec).await {
        Ok(output) if output.success() => {
            usable_local_addresses(directives::inet_addresses(&output.stdout), tunnel_prefix)
        }
        Ok(output) => {
            error!("ip addr show failed: {}", output.stderr.trim());
            Vec::new()
        }
        Err(e) => {
            error!("Error getting server IPs: {}", e);
            Vec::new()
        }
    }
}

/// Resolves the host's public IPv4 address
#[async_trait]
pub trait PublicAddressResolver: Send + Sync {
    /// None when no source gave a well-formed answer
    async fn resolve(&self) -> Option<Ipv4Addr>;
}

/// Asks a list of plain-text HTTP services in order; the first answer that
/// is a strict dotted quad wins.
pub struct HttpAddressResolver {
    client: reqwest::Client,
    services: Vec<String>,
}

impl HttpAddressResolver {
    pub fn new(settings: &PublicAddressSettings) -> NodeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| NodeError::ConfigError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            services: settings.services.clone(),
        })
    }

    async fn query(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl PublicAddressResolver for HttpAddressResolver {
    async fn resolve(&self) -> Option<Ipv4Addr> {
        for url in &self.services {
            match self.query(url).await {
                Ok(body) => match parse_strict_ipv4(&body) {
                    Some(ip) => {
                        debug!("Public address {} from {}", ip, url);
                        return Some(ip);
                    }
                    None => warn!("Ignoring malformed answer from {}: {:?}", url, body.trim()),
                },
                Err(e) => warn!("Public address lookup via {} failed: {}", url, e),
            }
        }
        error!("Could not determine public address from {} services", self.services.len());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};

    const IP_ADDR: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536\n    inet 127.0.0.1/8 scope host lo\n\
2: tun0: <POINTOPOINT,UP> mtu 1500\n    inet 10.8.0.1/24 scope global tun0\n\
3: eth0: <BROADCAST,UP> mtu 1500\n    inet 192.0.2.10/24 brd 192.0.2.255 scope global eth0\n\
4: eth1: <BROADCAST,UP> mtu 1500\n    inet 198.51.100.4/24 scope global eth1\n";

    #[test]
    fn test_usable_local_addresses() {
        let ips = directives::inet_addresses(IP_ADDR);
        assert_eq!(usable_local_addresses(ips, "10.8."), vec!["192.0.2.10", "198.51.100.4"]);
    }

    #[tokio::test]
    async fn test_host_addresses_via_runner() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "ip" && spec.args == ["addr", "show"])
            .times(1)
            .returning(|_| Ok(CommandOutput::ok(IP_ADDR)));

        let ips = host_ipv4_addresses(&runner, "10.8.", Duration::from_secs(5)).await;
        assert_eq!(ips.first().map(String::as_str), Some("192.0.2.10"));
    }

    #[tokio::test]
    async fn test_host_addresses_command_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|spec| Err(NodeError::timeout(spec.display(), spec.timeout)));

        assert!(host_ipv4_addresses(&runner, "10.8.", Duration::from_secs(5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_http_resolver_without_services() {
        let settings = PublicAddressSettings {
            services: Vec::new(),
            timeout_secs: 1,
        };
        let resolver = HttpAddressResolver::new(&settings).unwrap();
        assert_eq!(resolver.resolve().await, None);
    }
}
