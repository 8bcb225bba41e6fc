//! Persistent meshgate configuration
//!
//! A single JSON document describes the whole policy: mesh peers with their
//! permissions, the allowlist, and the host flags. `meshgate` reads it on
//! every run and on `SIGHUP`.

use crate::core::error::{Error, Result};
use crate::core::model::{Allowlist, FirewallSettings, Peer};
use crate::utils::get_config_dir;
use crate::validators::{parse_peer_address, validate_interface, validate_port, validate_subnet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Allowlist as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default)]
    pub tcp_ports: Vec<u32>,
    #[serde(default)]
    pub udp_ports: Vec<u32>,
    /// CIDR strings, e.g. `192.168.1.0/24`
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// A mesh peer as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Mesh address; peers without a parseable one are ignored
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub allow_routing: bool,
    #[serde(default)]
    pub allow_local_network: bool,
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Physical interfaces for kill switch and allowlist rules; empty means auto-detect
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Expose this host's LAN to peers with local network permission
    #[serde(default = "default_true")]
    pub lan_discovery: bool,
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default)]
    pub allowlist_enabled: bool,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Override for the `iptables` binary (e.g. `/usr/sbin/iptables-legacy`)
    #[serde(default)]
    pub iptables_path: Option<PathBuf>,
    /// Toggle `net.ipv4.ip_forward` on enable and restore it on teardown
    #[serde(default = "default_true")]
    pub manage_ip_forward: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            lan_discovery: true,
            kill_switch: false,
            allowlist_enabled: false,
            allowlist: AllowlistConfig::default(),
            peers: Vec::new(),
            iptables_path: None,
            manage_ip_forward: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Validated allowlist.
    ///
    /// # Errors
    ///
    /// Returns the first invalid port or subnet.
    pub fn to_allowlist(&self) -> Result<Allowlist> {
        let ports = |raw: &[u32]| -> Result<BTreeSet<u16>> {
            raw.iter().map(|&p| validate_port(p)).collect()
        };
        Ok(Allowlist {
            tcp_ports: ports(&self.allowlist.tcp_ports)?,
            udp_ports: ports(&self.allowlist.udp_ports)?,
            subnets: self
                .allowlist
                .subnets
                .iter()
                .map(|s| validate_subnet(s))
                .collect::<Result<_>>()?,
        })
    }

    /// Peers with parsed addresses. Unparseable addresses become absent.
    pub fn to_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .map(|p| Peer {
                address: p.address.as_deref().and_then(parse_peer_address),
                allows_routing: p.allow_routing,
                allows_local_network: p.allow_local_network,
            })
            .collect()
    }

    /// True when the peers described here are not exactly `stored`.
    pub fn peers_differ(&self, stored: &[Peer]) -> bool {
        self.to_peers() != stored
    }

    /// Configured interfaces, validated. Empty when auto-detection applies.
    ///
    /// # Errors
    ///
    /// Returns the first invalid interface name.
    pub fn validated_interfaces(&self) -> Result<Vec<String>> {
        self.interfaces
            .iter()
            .map(|name| validate_interface(name))
            .collect()
    }

    /// Settings for a resync, with `lan_available` following `lan_discovery`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allowlist is invalid.
    pub fn to_settings(&self) -> Result<FirewallSettings> {
        Ok(FirewallSettings {
            lan_available: self.lan_discovery,
            kill_switch: self.kill_switch,
            allowlist_enabled: self.allowlist_enabled,
            allowlist: self.to_allowlist()?,
        })
    }
}

/// Default location: `~/.config/meshgate/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config at `path`, or defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no config at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if the directory is missing or any write step fails.
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
        .await
        .map_err(|e| Error::Internal(format!("config writer task failed: {e}")))?
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
