//! Peer traffic rule composition
//!
//! iptables evaluates a chain top to bottom and the first matching rule wins.
//! Every rule emitted here is inserted at the head of FORWARD, so the rule
//! inserted last is evaluated first. [`Tier`] fixes the evaluation priority and
//! [`compose`] turns peers and policy into a [`Plan`] whose steps are already in
//! insertion order (lowest priority first). Applying a plan is a single pass.
//!
//! Evaluation order, top of the chain first:
//!
//! | Tier | Rules |
//! |------|-------|
//! | 1 `PeerLocalAccess` | per-peer ACCEPT to private ranges, or one ACCEPT-all for a local+routing peer when the kill switch is off |
//! | 2 `KillSwitchBlock` | DROP out of each physical interface |
//! | 3 `PrivateSubnetBlock` | DROP mesh to each private range |
//! | 4 `AllowlistReachability` | ACCEPT allow-listed subnets out of each interface |
//! | 5 `PeerFullAccess` | ACCEPT-all for routing peers without local access |
//!
//! The permanent baseline (see [`crate::core::baseline`]) sits below all tiers.

use crate::core::error::{Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::model::TrafficPeer;
use crate::core::rule::{Rule, Tag, Target, mesh_subnet, private_ranges};
use ipnetwork::Ipv4Network;
use std::cmp::Reverse;
use tracing::debug;

/// Evaluation priority of a FORWARD rule group. Lower values are evaluated first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Tier {
    #[strum(serialize = "peer local access")]
    PeerLocalAccess = 1,
    #[strum(serialize = "kill switch block")]
    KillSwitchBlock = 2,
    #[strum(serialize = "private subnet block")]
    PrivateSubnetBlock = 3,
    #[strum(serialize = "allowlist reachability")]
    AllowlistReachability = 4,
    #[strum(serialize = "peer full access")]
    PeerFullAccess = 5,
}

/// How a step reaches the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Insert at the head
    Insert,
    /// Delete any existing copy, then insert at the head
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub tier: Tier,
    pub action: Action,
    pub rule: Rule,
}

/// Policy inputs that shape the FORWARD rules besides the peers themselves.
#[derive(Debug, Clone, Copy)]
pub struct ForwardPolicy<'a> {
    /// Physical interfaces the kill switch and allowlist rules are bound to
    pub interfaces: &'a [String],
    pub kill_switch: bool,
    pub allowlist_enabled: bool,
    /// Allow-listed IPv4 subnets
    pub allowlist_subnets: &'a [Ipv4Network],
}

impl ForwardPolicy<'_> {
    /// Allowlist reachability rules are emitted when either flag is set.
    pub fn wants_allowlist_rules(&self) -> bool {
        self.allowlist_enabled || self.kill_switch
    }
}

/// FORWARD steps in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Builds a plan from steps in any tier order.
    ///
    /// Steps are stably sorted so lower priority tiers are inserted first; within a
    /// tier the given order is the insertion order.
    pub fn from_steps(mut steps: Vec<Step>) -> Self {
        steps.sort_by_key(|step| Reverse(step.tier));
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Rules as they will read from the top of the chain once applied.
    pub fn evaluation_order(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().rev()
    }

    /// Executes every step in order, stopping at the first failure.
    pub fn apply<E: CommandExecutor>(&self, ipt: &Iptables<E>) -> Result<()> {
        for step in &self.steps {
            debug!("[{}] {}", step.tier, step.rule);
            if step.action == Action::Refresh {
                ipt.delete_if_present(&step.rule)
                    .with_context(|| format!("deleting {} rule {}", step.tier, step.rule))?;
            }
            ipt.insert(&step.rule)
                .with_context(|| format!("inserting {} rule {}", step.tier, step.rule))?;
        }
        Ok(())
    }
}

/// ACCEPT for every subnet out of every interface, interface-major.
pub fn allowlist_reachability_rules(interfaces: &[String], subnets: &[Ipv4Network]) -> Vec<Rule> {
    interfaces
        .iter()
        .flat_map(|iface| {
            subnets.iter().map(move |&subnet| {
                Rule::forward(Target::Accept, Tag::AllowlistTransient)
                    .destination(subnet)
                    .out_via(iface.as_str())
            })
        })
        .collect()
}

fn full_access(peer: &TrafficPeer) -> Rule {
    Rule::forward(Target::Accept, Tag::ExitnodeTransient).source(peer.prefix)
}

/// Computes the FORWARD rules for `peers` under `policy`.
///
/// A peer never receives both the full access rule and the local-only rules:
/// routing without local access gets tier 5; local and routing with the kill
/// switch off gets a single full access rule at tier 1; any other local peer
/// gets the four private range rules at tier 1.
pub fn compose(peers: &[TrafficPeer], policy: &ForwardPolicy<'_>) -> Plan {
    let mut steps = Vec::new();
    let mut push = |tier: Tier, action: Action, rule: Rule| steps.push(Step { tier, action, rule });

    for peer in peers {
        if peer.routing && !peer.local_network {
            push(Tier::PeerFullAccess, Action::Insert, full_access(peer));
        }
    }

    if policy.wants_allowlist_rules() {
        for rule in allowlist_reachability_rules(policy.interfaces, policy.allowlist_subnets) {
            push(Tier::AllowlistReachability, Action::Insert, rule);
        }
    }

    for range in private_ranges() {
        let block = Rule::forward(Target::Drop, Tag::ExitnodeTransient)
            .source(mesh_subnet())
            .destination(range);
        push(Tier::PrivateSubnetBlock, Action::Refresh, block);
    }

    if policy.kill_switch {
        for iface in policy.interfaces {
            let block = Rule::forward(Target::Drop, Tag::ExitnodeTransient).out_via(iface.as_str());
            push(Tier::KillSwitchBlock, Action::Insert, block);
        }
    }

    for peer in peers.iter().filter(|p| p.local_network) {
        if peer.routing && !policy.kill_switch {
            push(Tier::PeerLocalAccess, Action::Insert, full_access(peer));
        } else {
            for range in private_ranges() {
                let rule = Rule::forward(Target::Accept, Tag::ExitnodeTransient)
                    .source(peer.prefix)
                    .destination(range);
                push(Tier::PeerLocalAccess, Action::Insert, rule);
            }
        }
    }

    Plan::from_steps(steps)
}
