//! Directory management and host interface discovery
//!
//! Paths follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/meshgate/` - `config.json`
//! - State: `~/.local/state/meshgate/` - audit log, daemon log

use directories::ProjectDirs;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Name prefixes of tunnels, bridges and container links. Kill switch rules
/// only make sense on uplinks.
const VIRTUAL_PREFIXES: &[&str] = &[
    "tun", "tap", "wg", "nordlynx", "nordtun", "docker", "br-", "veth", "virbr", "vmnet",
    "tailscale", "zt",
];

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meshgate", "meshgate")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    let dirs = [get_config_dir(), get_state_dir()];

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        for dir in dirs.into_iter().flatten() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        for dir in dirs.into_iter().flatten() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// True for loopback and for names that look like virtual links.
pub fn is_virtual_interface(name: &str) -> bool {
    name == "lo" || VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Keeps physical names, deduplicated and sorted.
pub fn filter_physical<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .filter(|name| !is_virtual_interface(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Physical interfaces of this host.
///
/// `network-interface` reports one entry per address, so names repeat.
pub fn physical_interfaces() -> Vec<String> {
    match NetworkInterface::show() {
        Ok(interfaces) => filter_physical(interfaces.into_iter().map(|iface| iface.name)),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {e}");
            Vec::new()
        }
    }
}
