//! Allowlist reachability for mesh peers
//!
//! When this host does not expose its whole LAN, peers with local network
//! permission would otherwise be cut off from it entirely. The
//! [`AllowlistManager`] grants those peers the allow-listed private
//! destinations instead, plus allow-listed ports for peers that may also route.
//!
//! These rules share the `nordvpn-allowlist-transient` tag with the interface
//! scoped reachability rules, so the manager removes exactly the rules it
//! computed from its stored state rather than wiping the tag. Call
//! [`AllowlistManager::disable`] before replacing that state, otherwise rules for
//! revoked permissions are left behind.

use crate::core::composer::allowlist_reachability_rules;
use crate::core::error::{Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::introspect::clear_rules;
use crate::core::model::{Allowlist, Peer};
use crate::core::rule::{Chain, Protocol, Rule, Tag, Target};
use ipnetwork::Ipv4Network;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct AllowlistManager {
    allowlist: Allowlist,
    peers: Vec<Peer>,
}

impl AllowlistManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn set_allowlist(&mut self, allowlist: Allowlist) {
        self.allowlist = allowlist;
    }

    pub fn set_peers(&mut self, peers: Vec<Peer>) {
        self.peers = peers;
    }

    /// Rules implied by the stored allowlist and peers, in insertion order.
    ///
    /// Subnet rules cover only private and link-local subnets. Port rules are
    /// limited to peers that may also route, since a port rule matches any
    /// destination.
    pub fn rules(&self) -> Vec<Rule> {
        let local: Vec<(Ipv4Network, bool)> = self
            .peers
            .iter()
            .filter(|peer| peer.allows_local_network)
            .filter_map(|peer| peer.prefix().map(|prefix| (prefix, peer.allows_routing)))
            .collect();

        let mut rules = Vec::new();
        for subnet in self.allowlist.ipv4_subnets() {
            if !(subnet.ip().is_private() || subnet.ip().is_link_local()) {
                debug!("not granting public allowlist subnet {subnet} to peers");
                continue;
            }
            rules.extend(local.iter().map(|&(prefix, _)| {
                Rule::forward(Target::Accept, Tag::AllowlistTransient)
                    .source(prefix)
                    .destination(subnet)
            }));
        }

        for protocol in [Protocol::Tcp, Protocol::Udp] {
            for range in self.allowlist.port_ranges(protocol) {
                rules.extend(local.iter().filter(|&&(_, routing)| routing).map(
                    |&(prefix, _)| {
                        Rule::forward(Target::Accept, Tag::AllowlistTransient)
                            .source(prefix)
                            .dport(protocol, range)
                    },
                ));
            }
        }
        rules
    }

    /// Inserts every rule implied by the stored state.
    pub fn enable<E: CommandExecutor>(&self, ipt: &Iptables<E>) -> Result<()> {
        let rules = self.rules();
        for rule in &rules {
            ipt.insert(rule)
                .with_context(|| format!("adding allowlist rule {rule}"))?;
        }
        if !rules.is_empty() {
            info!("granted {} allowlist rule(s) to local peers", rules.len());
        }
        Ok(())
    }

    /// Deletes every rule implied by the stored state, ignoring ones already gone.
    pub fn disable<E: CommandExecutor>(&self, ipt: &Iptables<E>) -> Result<usize> {
        let mut removed = 0;
        for rule in self.rules() {
            if ipt
                .delete_if_present(&rule)
                .with_context(|| format!("removing allowlist rule {rule}"))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Rebuilds the interface scoped allowlist rules alone.
///
/// Used while mesh forwarding is off, when peer rules are irrelevant.
pub fn reset_allowlist_rules<E: CommandExecutor>(
    ipt: &Iptables<E>,
    interfaces: &[String],
    kill_switch: bool,
    allowlist_enabled: bool,
    subnets: &[Ipv4Network],
) -> Result<()> {
    clear_rules(ipt, Chain::Forward, &[Tag::AllowlistTransient])
        .context("removing allowlisted subnets")?;

    if allowlist_enabled || kill_switch {
        for rule in allowlist_reachability_rules(interfaces, subnets) {
            ipt.insert(&rule)
                .with_context(|| format!("adding allowlisted subnet rule {rule}"))?;
        }
    }
    Ok(())
}
