//! Input validation
//!
//! Everything that ends up in a config file, an installer prompt or a
//! command line passes through here first.

use crate::error::{NodeError, NodeResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};

/// Maximum length for a tunnel user name
const MAX_USER_NAME_LEN: usize = 64;

/// Protocols accepted by the `proto` directive
pub const VALID_PROTOCOLS: &[&str] = &["udp", "tcp", "udp4", "udp6", "tcp4", "tcp6"];

static DOTTED_QUAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("static regex"));

/// Validate and normalize a tunnel user name
///
/// Returns the trimmed name. Control characters would be typed straight
/// into the installer's prompt, so they are rejected.
pub fn validate_user_name(name: &str) -> NodeResult<String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(NodeError::Validation("User name cannot be empty".to_string()));
    }

    if trimmed.chars().any(|c| c.is_control()) {
        return Err(NodeError::Validation(
            "User name contains control characters".to_string(),
        ));
    }

    if trimmed.len() > MAX_USER_NAME_LEN {
        return Err(NodeError::Validation(format!(
            "User name too long (max {} characters)",
            MAX_USER_NAME_LEN
        )));
    }

    if trimmed.contains('/') {
        return Err(NodeError::Validation(
            "User name cannot contain '/'".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

/// Strict dotted-quad IPv4 check, as used for public address answers
pub fn parse_strict_ipv4(value: &str) -> Option<Ipv4Addr> {
    let value = value.trim();
    if !DOTTED_QUAD.is_match(value) {
        return None;
    }
    value.parse::<Ipv4Addr>().ok()
}

/// Validate a transport protocol name, returning it lowercased
pub fn validate_protocol(proto: &str) -> NodeResult<String> {
    let proto = proto.trim().to_ascii_lowercase();
    if VALID_PROTOCOLS.contains(&proto.as_str()) {
        Ok(proto)
    } else {
        Err(NodeError::Validation(format!(
            "Invalid protocol '{}': expected one of {}",
            proto,
            VALID_PROTOCOLS.join(", ")
        )))
    }
}

/// Validate a listening port
pub fn validate_port(port: u32) -> NodeResult<u16> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(NodeError::Validation(format!(
            "Invalid port {}: must be between 1 and 65535",
            port
        ))),
    }
}

/// Validate hostname or IP address used as a `remote` target
pub fn validate_hostname(host: &str) -> NodeResult<()> {
    if host.is_empty() {
        return Err(NodeError::Validation("Hostname cannot be empty".to_string()));
    }

    if host.len() > 253 {
        return Err(NodeError::Validation("Hostname too long".to_string()));
    }

    // Try parsing as IP address first
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(NodeError::Validation(format!(
                "Invalid hostname character: {:?}",
                c
            )));
        }
    }

    // No leading/trailing dashes or dots
    if host.starts_with('-') || host.starts_with('.') || host.ends_with('-') || host.ends_with('.')
    {
        return Err(NodeError::Validation("Invalid hostname format".to_string()));
    }

    Ok(())
}
