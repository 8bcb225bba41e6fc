//! Input validation for configuration values
//!
//! Everything that ends up as an `iptables` argument passes through here
//! first, so malformed input is rejected before any command runs.

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if the port is 0 (reserved) or above 65535.
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(0) => Err(Error::InvalidPort {
            port,
            reason: "port 0 is reserved".to_string(),
        }),
        Ok(port) => Ok(port),
        Err(_) => Err(Error::InvalidPort {
            port,
            reason: "must be between 1 and 65535".to_string(),
        }),
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - 1 to 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if the name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidInterface {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > 15 {
        return Err(invalid("too long (max 15 characters)"));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(invalid("contains invalid characters"));
    }

    Ok(name.to_string())
}

/// Parses a subnet in CIDR notation. A bare address is taken as a host route.
///
/// # Errors
///
/// Returns `Err` if the text is not an IPv4 or IPv6 network.
pub fn validate_subnet(value: &str) -> Result<IpNetwork> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidSubnet {
            value: value.to_string(),
            reason: "empty".to_string(),
        });
    }
    trimmed
        .parse::<IpNetwork>()
        .map_err(|e| Error::InvalidSubnet {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Parses a peer address, yielding `None` for anything unusable.
///
/// Peers without a valid address are skipped rather than rejected.
pub fn parse_peer_address(value: &str) -> Option<IpAddr> {
    match value.trim().parse::<IpAddr>() {
        Ok(addr) if !addr.is_unspecified() => Some(addr),
        _ => {
            tracing::debug!("ignoring peer with unusable address '{value}'");
            None
        }
    }
}
