//! Permanent default-deny floor for mesh traffic
//!
//! Installed once per session and only removed on teardown. Each rule goes in
//! at position 1, so after installation the chain reads:
//!
//! ```text
//! -d 100.64.0.0/10 -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
//! -d 100.64.0.0/10 -j DROP
//! -s 100.64.0.0/10 -j DROP
//! ```

use crate::core::error::{Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::introspect::clear_rules;
use crate::core::rule::{Chain, Rule, Tag, Target, mesh_subnet};
use tracing::{debug, info, warn};

/// Baseline rules in insertion order.
pub fn baseline_rules() -> [Rule; 3] {
    let mesh = mesh_subnet();
    [
        Rule::forward(Target::Drop, Tag::ExitnodePermanent).source(mesh),
        Rule::forward(Target::Drop, Tag::ExitnodePermanent).destination(mesh),
        Rule::forward(Target::Accept, Tag::ExitnodePermanent)
            .destination(mesh)
            .established(),
    ]
}

/// Whether the baseline needed installing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineState {
    AlreadyPresent,
    Installed,
    /// A partial baseline from an interrupted run was replaced
    Repaired,
}

/// Installs the baseline unless it is already complete.
///
/// A partial baseline is cleared and reinstalled so the three rules always
/// sit together in the expected order.
pub fn enable_filtering<E: CommandExecutor>(ipt: &Iptables<E>) -> Result<BaselineState> {
    let listed = ipt
        .list(Chain::Forward.table(), Chain::Forward.as_ref())
        .context("checking for existing baseline rules")?;

    let rules = baseline_rules();
    let present = rules
        .iter()
        .filter(|rule| listed.iter().any(|l| rule.matches_listed(l)))
        .count();

    if present == rules.len() {
        debug!("baseline rules already installed");
        return Ok(BaselineState::AlreadyPresent);
    }

    let state = if present > 0 {
        warn!(
            "found {present} of {} baseline rules, reinstalling",
            rules.len()
        );
        clear_rules(ipt, Chain::Forward, &[Tag::ExitnodePermanent])
            .context("clearing partial baseline")?;
        BaselineState::Repaired
    } else {
        BaselineState::Installed
    };

    for rule in &rules {
        ipt.insert_at(rule, 1)
            .with_context(|| format!("inserting baseline rule {rule}"))?;
    }
    info!("installed mesh baseline rules");
    Ok(state)
}
