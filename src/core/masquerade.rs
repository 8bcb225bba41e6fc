//! Source NAT for peers routing through this host

use crate::core::error::{Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::introspect::clear_rules;
use crate::core::model::TrafficPeer;
use crate::core::rule::{Chain, Rule, Tag};
use tracing::debug;

/// One MASQUERADE rule per routing peer, in peer order.
pub fn masquerade_rules(peers: &[TrafficPeer]) -> Vec<Rule> {
    peers
        .iter()
        .filter(|peer| peer.routing)
        .map(|peer| Rule::masquerade(peer.prefix))
        .collect()
}

/// Appends masquerade rules for every routing peer.
///
/// Each rule is scoped to a single source address, so position in
/// POSTROUTING does not matter.
pub fn enable_masquerading<E: CommandExecutor>(
    ipt: &Iptables<E>,
    peers: &[TrafficPeer],
) -> Result<()> {
    for rule in masquerade_rules(peers) {
        ipt.append(&rule)
            .with_context(|| format!("adding masquerade rule {rule}"))?;
    }
    Ok(())
}

/// Removes every `nordvpn` tagged POSTROUTING rule, whatever interface it names.
pub fn clear_masquerading<E: CommandExecutor>(ipt: &Iptables<E>) -> Result<usize> {
    let removed = clear_rules(ipt, Chain::Postrouting, &[Tag::Masquerade])?;
    debug!("removed {removed} masquerade rule(s)");
    Ok(removed)
}
