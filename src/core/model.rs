//! Policy inputs: mesh peers and the allowlist
//!
//! These types are supplied by the caller on every resync and are only ever
//! read by the engine.

use crate::core::rule::{PortRange, Protocol};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

/// A mesh peer and the permissions this host grants it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Peer {
    /// Mesh address; `None` when the peer has not been assigned one
    pub address: Option<IpAddr>,
    /// Peer may use this host as an exit node
    pub allows_routing: bool,
    /// Peer may reach this host's local networks
    pub allows_local_network: bool,
}

impl Peer {
    pub fn new(address: IpAddr, allows_routing: bool, allows_local_network: bool) -> Self {
        Self {
            address: Some(address),
            allows_routing,
            allows_local_network,
        }
    }

    /// Host prefix for the peer's address, if it has a usable IPv4 one.
    pub fn prefix(&self) -> Option<Ipv4Network> {
        match self.address? {
            IpAddr::V4(addr) => Some(Ipv4Network::from(addr)),
            IpAddr::V6(addr) => {
                debug!("skipping IPv6 peer {addr}: only IPv4 forwarding is managed");
                None
            }
        }
    }
}

/// The slice of a [`Peer`] the rule composer works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficPeer {
    pub prefix: Ipv4Network,
    pub routing: bool,
    pub local_network: bool,
}

impl TrafficPeer {
    /// Converts peers, dropping those without a usable address.
    ///
    /// Local network permission only takes effect while this host exposes its
    /// LAN (`lan_available`); otherwise the allowlist path covers those peers.
    pub fn from_peers(peers: &[Peer], lan_available: bool) -> Vec<Self> {
        peers
            .iter()
            .filter_map(|peer| {
                peer.prefix().map(|prefix| TrafficPeer {
                    prefix,
                    routing: peer.allows_routing,
                    local_network: peer.allows_local_network && lan_available,
                })
            })
            .collect()
    }
}

/// Ports and subnets reachable regardless of otherwise restrictive policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Allowlist {
    #[serde(default)]
    pub tcp_ports: BTreeSet<u16>,
    #[serde(default)]
    pub udp_ports: BTreeSet<u16>,
    #[serde(default)]
    pub subnets: Vec<IpNetwork>,
}

impl Allowlist {
    pub fn is_empty(&self) -> bool {
        self.tcp_ports.is_empty() && self.udp_ports.is_empty() && self.subnets.is_empty()
    }

    /// Coalesced port ranges for `protocol`.
    pub fn port_ranges(&self, protocol: Protocol) -> Vec<PortRange> {
        match protocol {
            Protocol::Tcp => coalesce_ports(self.tcp_ports.iter().copied()),
            Protocol::Udp => coalesce_ports(self.udp_ports.iter().copied()),
        }
    }

    /// IPv4 subnets with host bits cleared and without duplicates, in
    /// configuration order.
    pub fn ipv4_subnets(&self) -> Vec<Ipv4Network> {
        let mut seen = Vec::with_capacity(self.subnets.len());
        for subnet in &self.subnets {
            match subnet {
                IpNetwork::V4(net) => {
                    let net = Ipv4Network::new(net.network(), net.prefix()).unwrap_or(*net);
                    if !seen.contains(&net) {
                        seen.push(net);
                    }
                }
                IpNetwork::V6(net) => debug!("skipping IPv6 allowlist subnet {net}"),
            }
        }
        seen
    }
}

/// Host-wide settings passed on every resync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirewallSettings {
    /// This host currently exposes its own LAN to the mesh
    pub lan_available: bool,
    pub kill_switch: bool,
    pub allowlist_enabled: bool,
    pub allowlist: Allowlist,
}

/// Groups ports into contiguous ranges so each range costs one rule.
///
/// Input order and duplicates do not matter.
pub fn coalesce_ports(ports: impl IntoIterator<Item = u16>) -> Vec<PortRange> {
    let sorted: BTreeSet<u16> = ports.into_iter().collect();
    let mut ranges: Vec<PortRange> = Vec::new();

    for port in sorted {
        match ranges.last_mut() {
            Some(range) if range.end.checked_add(1) == Some(port) => range.end = port,
            _ => ranges.push(PortRange::single(port)),
        }
    }
    ranges
}
