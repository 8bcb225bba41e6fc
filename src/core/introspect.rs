//! Reading back and clearing owned rules
//!
//! The live ruleset is the only state meshgate keeps. Every clear lists the
//! chain once and deletes the listed rules by tag, so a resync run against a
//! half-cleared chain converges instead of failing.

use crate::core::error::{Result, ResultExt};
use crate::core::executor::{CommandExecutor, Iptables};
use crate::core::rule::{Chain, ListedRule, Tag};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

/// Deletes every rule in `chain` whose comment is one of `tags`.
///
/// All rules bearing the first tag are deleted before any rule bearing the
/// second, and so on. A deletion the tool rejects because the rule is already
/// gone counts as done; any other failure aborts the call.
///
/// Returns the number of rules actually removed.
pub fn clear_rules<E: CommandExecutor>(
    ipt: &Iptables<E>,
    chain: Chain,
    tags: &[Tag],
) -> Result<usize> {
    let listed = ipt
        .list(chain.table(), chain.as_ref())
        .with_context(|| format!("listing {chain} rules"))?;

    let mut removed = 0;
    for &tag in tags {
        for rule in listed.iter().filter(|rule| rule.has_tag(tag)) {
            match ipt.run(&rule.delete_args()) {
                Ok(_) => removed += 1,
                Err(e) if e.is_missing_rule() => {
                    warn!("owned rule vanished before deletion: {rule}");
                }
                Err(e) => return Err(e.context(format!("deleting rule {rule}"))),
            }
        }
    }

    debug!("cleared {removed} rule(s) from {chain} for {tags:?}");
    Ok(removed)
}

/// Owned rules currently present in `chain`, in evaluation order.
pub fn owned_rules<E: CommandExecutor>(
    ipt: &Iptables<E>,
    chain: Chain,
) -> Result<Vec<(Tag, ListedRule)>> {
    let listed = ipt
        .list(chain.table(), chain.as_ref())
        .with_context(|| format!("listing {chain} rules"))?;

    Ok(listed
        .into_iter()
        .filter_map(|rule| Tag::iter().find(|&tag| rule.has_tag(tag)).map(|tag| (tag, rule)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Error, MISSING_RULE_MESSAGE};
    use crate::core::test_helpers::{FakeIptables, RecordingExecutor};

    const MIXED_FORWARD: &str = "\
-P FORWARD ACCEPT
-A FORWARD -s 100.64.0.2/32 -m comment --comment nordvpn-exitnode-transient -j ACCEPT
-A FORWARD -d 10.0.0.0/8 -o eth0 -m comment --comment nordvpn-allowlist-transient -j ACCEPT
-A FORWARD -o docker0 -j DOCKER
-A FORWARD -s 100.64.0.0/10 -d 10.0.0.0/8 -m comment --comment nordvpn-exitnode-transient -j DROP
-A FORWARD -d 192.168.0.0/16 -o eth0 -m comment --comment nordvpn-allowlist-transient -j ACCEPT
-A FORWARD -s 100.64.0.0/10 -m comment --comment nordvpn-exitnode-permanent -j DROP
";

    #[test]
    fn test_clear_deletes_allowlist_before_exitnode() {
        let exec = RecordingExecutor::new().with_output("-t filter -S FORWARD", MIXED_FORWARD);
        let ipt = Iptables::new(&exec);

        let removed = clear_rules(
            &ipt,
            Chain::Forward,
            &[Tag::AllowlistTransient, Tag::ExitnodeTransient],
        )
        .unwrap();
        assert_eq!(removed, 4);

        let deletions: Vec<String> = exec
            .commands()
            .into_iter()
            .filter(|c| c.contains(" -D "))
            .collect();
        assert_eq!(deletions.len(), 4);
        assert!(deletions[0].contains("-d 10.0.0.0/8 -o eth0"));
        assert!(deletions[1].contains("-d 192.168.0.0/16 -o eth0"));
        assert!(deletions[2].contains("-s 100.64.0.2/32"));
        assert!(deletions[3].contains("-s 100.64.0.0/10 -d 10.0.0.0/8"));

        // rules with foreign or other tags are never touched
        assert!(!exec.commands().iter().any(|c| c.contains("DOCKER")));
        assert!(!exec.commands().iter().any(|c| c.contains("permanent")));
    }

    #[test]
    fn test_clear_lists_exactly_once() {
        let exec = RecordingExecutor::new().with_output("-t filter -S FORWARD", MIXED_FORWARD);
        let ipt = Iptables::new(&exec);
        clear_rules(
            &ipt,
            Chain::Forward,
            &[Tag::AllowlistTransient, Tag::ExitnodeTransient],
        )
        .unwrap();

        let listings = exec.commands().iter().filter(|c| c.contains(" -S ")).count();
        assert_eq!(listings, 1);
    }

    #[test]
    fn test_clear_tolerates_missing_rule() {
        // listed, but gone by the time the deletion runs
        let exec = RecordingExecutor::new()
            .with_output("-t filter -S FORWARD", MIXED_FORWARD)
            .with_failure(" -D FORWARD", &format!("iptables: {MISSING_RULE_MESSAGE}."));
        let ipt = Iptables::new(&exec);

        let removed = clear_rules(&ipt, Chain::Forward, &[Tag::ExitnodeTransient]).unwrap();
        assert_eq!(removed, 0);
        let attempts = exec.commands().iter().filter(|c| c.contains(" -D ")).count();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_clear_aborts_on_other_failure() {
        let fake = FakeIptables::new();
        fake.seed(
            "nat",
            "-A POSTROUTING -s 100.64.0.2/32 ! -d 100.64.0.0/10 -m comment --comment nordvpn -j MASQUERADE",
        );
        fake.fail_when("-D POSTROUTING", "iptables: Permission denied (you must be root).");
        let ipt = Iptables::new(&fake);

        let err = clear_rules(&ipt, Chain::Postrouting, &[Tag::Masquerade]).unwrap_err();
        assert!(matches!(err, Error::Context { .. }));
        assert!(err.to_string().contains("deleting rule -A POSTROUTING"));
        assert!(!err.is_missing_rule());
    }

    #[test]
    fn test_listing_failure_is_wrapped() {
        let fake = FakeIptables::new();
        fake.fail_when("-S FORWARD", "iptables: can't initialize iptables table `filter'");
        let ipt = Iptables::new(&fake);

        let err = clear_rules(&ipt, Chain::Forward, &[Tag::ExitnodePermanent]).unwrap_err();
        assert!(err.to_string().starts_with("listing FORWARD rules"));
    }

    #[test]
    fn test_owned_rules_classifies_by_tag() {
        let exec = RecordingExecutor::new().with_output("-t filter -S FORWARD", MIXED_FORWARD);
        let ipt = Iptables::new(&exec);

        let owned = owned_rules(&ipt, Chain::Forward).unwrap();
        let tags: Vec<Tag> = owned.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(
            tags,
            vec![
                Tag::ExitnodeTransient,
                Tag::AllowlistTransient,
                Tag::ExitnodeTransient,
                Tag::AllowlistTransient,
                Tag::ExitnodePermanent,
            ]
        );
    }
}
