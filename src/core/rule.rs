//! Structured iptables rules and their text forms
//!
//! Every rule meshgate installs is built as a [`Rule`] and rendered into an
//! argument vector for a given [`Operation`]. Rules read back from the live
//! ruleset (`iptables -S`) are parsed into [`ListedRule`], which keeps the
//! match clauses verbatim so that a rule can be deleted exactly as the kernel
//! reports it, even when it carries options meshgate would not generate.
//!
//! # Example
//!
//! ```
//! use meshgate::core::rule::{Operation, Rule, Tag, Target};
//!
//! let peer = "100.64.0.7/32".parse().unwrap();
//! let rule = Rule::forward(Target::Accept, Tag::ExitnodeTransient).source(peer);
//! assert_eq!(
//!     rule.render(Operation::Insert(None)).join(" "),
//!     "-t filter -I FORWARD -s 100.64.0.7/32 -m comment --comment nordvpn-exitnode-transient -j ACCEPT"
//! );
//! ```

use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;

/// The address range mesh peers are numbered from.
pub fn mesh_subnet() -> Ipv4Network {
    network(Ipv4Addr::new(100, 64, 0, 0), 10)
}

/// RFC 1918 ranges plus IPv4 link-local, in the order rules are emitted for them.
pub fn private_ranges() -> [Ipv4Network; 4] {
    [
        network(Ipv4Addr::new(10, 0, 0, 0), 8),
        network(Ipv4Addr::new(172, 16, 0, 0), 12),
        network(Ipv4Addr::new(192, 168, 0, 0), 16),
        network(Ipv4Addr::new(169, 254, 0, 0), 16),
    ]
}

fn network(addr: Ipv4Addr, prefix: u8) -> Ipv4Network {
    // prefix is always <= 32 for the literals above
    Ipv4Network::new(addr, prefix).unwrap_or_else(|_| Ipv4Network::from(addr))
}

/// iptables table
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
}

/// Built-in chains meshgate writes to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Chain {
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

impl Chain {
    /// The table this chain is managed in.
    pub const fn table(self) -> Table {
        match self {
            Chain::Forward => Table::Filter,
            Chain::Postrouting => Table::Nat,
        }
    }
}

/// Jump target
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Target {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "MASQUERADE")]
    Masquerade,
}

/// Ownership tag stored in the rule's `comment` match.
///
/// A listed rule belongs to meshgate if and only if its comment is exactly one
/// of these strings. Permanent and transient tags are never interchangeable.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
pub enum Tag {
    /// Default-deny baseline, installed at enable and removed at disable
    #[strum(serialize = "nordvpn-exitnode-permanent")]
    ExitnodePermanent,
    /// Per-peer and policy rules rebuilt on every resync
    #[strum(serialize = "nordvpn-exitnode-transient")]
    ExitnodeTransient,
    /// Allowlist reachability rules rebuilt on every resync
    #[strum(serialize = "nordvpn-allowlist-transient")]
    AllowlistTransient,
    /// NAT masquerade for peers routing through this host
    #[strum(serialize = "nordvpn")]
    Masquerade,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Transport protocol for port matches
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

/// Renders in `--dport` syntax: `22` or `1000:1005`.
impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// What to do with a rule when invoking the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Append,
    /// Insert at the head of the chain, or at the given 1-based position
    Insert(Option<u32>),
    Delete,
}

impl Operation {
    const fn flag(self) -> &'static str {
        match self {
            Operation::Append => "-A",
            Operation::Insert(_) => "-I",
            Operation::Delete => "-D",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: Chain,
    pub source: Option<Ipv4Network>,
    pub destination: Option<Ipv4Network>,
    /// Match packets whose destination is NOT `destination`
    pub negate_destination: bool,
    pub out_interface: Option<String>,
    pub port_match: Option<(Protocol, PortRange)>,
    /// Match only RELATED,ESTABLISHED conntrack states
    pub established: bool,
    pub tag: Tag,
    pub target: Target,
}

impl Rule {
    /// A FORWARD chain rule with no matches yet.
    pub fn forward(target: Target, tag: Tag) -> Self {
        Self {
            chain: Chain::Forward,
            source: None,
            destination: None,
            negate_destination: false,
            out_interface: None,
            port_match: None,
            established: false,
            tag,
            target,
        }
    }

    /// Source-NAT for `source`, excluding traffic that stays inside the mesh.
    pub fn masquerade(source: Ipv4Network) -> Self {
        Self {
            chain: Chain::Postrouting,
            source: Some(source),
            destination: Some(mesh_subnet()),
            negate_destination: true,
            out_interface: None,
            port_match: None,
            established: false,
            tag: Tag::Masquerade,
            target: Target::Masquerade,
        }
    }

    #[must_use]
    pub fn source(mut self, source: Ipv4Network) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: Ipv4Network) -> Self {
        self.destination = Some(destination);
        self.negate_destination = false;
        self
    }

    #[must_use]
    pub fn out_via(mut self, interface: impl Into<String>) -> Self {
        self.out_interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn dport(mut self, protocol: Protocol, ports: PortRange) -> Self {
        self.port_match = Some((protocol, ports));
        self
    }

    #[must_use]
    pub fn established(mut self) -> Self {
        self.established = true;
        self
    }

    pub const fn table(&self) -> Table {
        self.chain.table()
    }

    /// Match clauses and target, in the order `iptables -S` prints them.
    pub fn spec(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(16);
        if let Some(source) = self.source {
            args.push("-s".to_string());
            args.push(source.to_string());
        }
        if let Some(destination) = self.destination {
            if self.negate_destination {
                args.push("!".to_string());
            }
            args.push("-d".to_string());
            args.push(destination.to_string());
        }
        if let Some(ref iface) = self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }
        if let Some((protocol, ports)) = self.port_match {
            args.extend([
                "-p".to_string(),
                protocol.to_string(),
                "-m".to_string(),
                protocol.to_string(),
                "--dport".to_string(),
                ports.to_string(),
            ]);
        }
        if self.established {
            args.extend([
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                "RELATED,ESTABLISHED".to_string(),
            ]);
        }
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.tag.to_string(),
            "-j".to_string(),
            self.target.to_string(),
        ]);
        args
    }

    /// Full argument vector for the tool, table always explicit.
    pub fn render(&self, op: Operation) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table().to_string(),
            op.flag().to_string(),
            self.chain.to_string(),
        ];
        if let Operation::Insert(Some(position)) = op {
            args.push(position.to_string());
        }
        args.extend(self.spec());
        args
    }

    /// True if `listed` is this rule as reported by the live ruleset.
    pub fn matches_listed(&self, listed: &ListedRule) -> bool {
        listed.table == self.table()
            && listed.chain == self.chain.as_ref()
            && listed.spec == self.spec()
    }
}

/// Append form, as it would appear in `iptables -S` output.
impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, join_tokens(&self.spec()))
    }
}

/// One `-A` line from `iptables -t <table> -S <chain>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    pub table: Table,
    pub chain: String,
    /// Everything after the chain name, unquoted
    pub spec: Vec<String>,
    pub comment: Option<String>,
}

impl ListedRule {
    /// Parses a listing line. Policy (`-P`) and chain (`-N`) lines yield `None`.
    pub fn parse(table: Table, line: &str) -> Option<Self> {
        let mut tokens = split_tokens(line).into_iter();
        if tokens.next()? != "-A" {
            return None;
        }
        let chain = tokens.next()?;
        let spec: Vec<String> = tokens.collect();
        let comment = spec
            .windows(2)
            .find(|w| w[0] == "--comment")
            .map(|w| w[1].clone());
        Some(Self {
            table,
            chain,
            spec,
            comment,
        })
    }

    /// Parses a whole `-S` listing, skipping everything that is not a rule.
    pub fn parse_listing(table: Table, output: &str) -> Vec<Self> {
        output
            .lines()
            .filter_map(|line| Self::parse(table, line.trim()))
            .collect()
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.comment.as_deref() == Some(tag.as_str())
    }

    /// Deletion arguments for exactly this rule.
    pub fn delete_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            Operation::Delete.flag().to_string(),
            self.chain.clone(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

impl fmt::Display for ListedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, join_tokens(&self.spec))
    }
}

/// Splits a listing line on whitespace, honouring the double quotes iptables
/// puts around comments containing spaces.
pub fn split_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Inverse of [`split_tokens`] for display.
pub fn join_tokens(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| {
            if t.is_empty() || t.contains(char::is_whitespace) || t.contains('"') {
                format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                t.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_masquerade_render_matches_listing_form() {
        let rule = Rule::masquerade(net("10.5.0.2/32"));
        assert_eq!(
            rule.to_string(),
            "-A POSTROUTING -s 10.5.0.2/32 ! -d 100.64.0.0/10 -m comment --comment nordvpn -j MASQUERADE"
        );
        let args = rule.render(Operation::Append);
        assert_eq!(args[..4], ["-t", "nat", "-A", "POSTROUTING"]);
    }

    #[test]
    fn test_tag_text_matches_comment() {
        use std::str::FromStr;
        use strum::IntoEnumIterator;

        assert_eq!(Tag::ExitnodePermanent.as_str(), "nordvpn-exitnode-permanent");
        assert_eq!(Tag::Masquerade.as_str(), "nordvpn");
        for tag in Tag::iter() {
            assert_eq!(tag.as_str(), tag.to_string());
            assert_eq!(Tag::from_str(tag.as_str()).unwrap(), tag);
        }
    }

    #[test]
    fn test_insert_at_position() {
        let rule = Rule::forward(Target::Drop, Tag::ExitnodePermanent).source(mesh_subnet());
        assert_eq!(
            rule.render(Operation::Insert(Some(1))).join(" "),
            "-t filter -I FORWARD 1 -s 100.64.0.0/10 -m comment --comment nordvpn-exitnode-permanent -j DROP"
        );
    }

    #[test]
    fn test_port_range_and_conntrack_render() {
        let rule = Rule::forward(Target::Accept, Tag::AllowlistTransient)
            .source(net("100.64.0.9/32"))
            .dport(Protocol::Udp, PortRange { start: 2000, end: 2001 });
        assert_eq!(
            rule.spec().join(" "),
            "-s 100.64.0.9/32 -p udp -m udp --dport 2000:2001 -m comment --comment nordvpn-allowlist-transient -j ACCEPT"
        );

        let established = Rule::forward(Target::Accept, Tag::ExitnodePermanent)
            .destination(mesh_subnet())
            .established();
        assert_eq!(
            established.to_string(),
            "-A FORWARD -d 100.64.0.0/10 -m conntrack --ctstate RELATED,ESTABLISHED -m comment --comment nordvpn-exitnode-permanent -j ACCEPT"
        );
    }

    #[test]
    fn test_delete_form_of_listed_rule() {
        let listed = ListedRule::parse(
            Table::Nat,
            "-A POSTROUTING -s 202.242.38.68/32 -o nordtun -j MASQUERADE -m comment --comment nordvpn",
        )
        .unwrap();
        assert!(listed.has_tag(Tag::Masquerade));
        assert_eq!(
            listed.delete_args().join(" "),
            "-t nat -D POSTROUTING -s 202.242.38.68/32 -o nordtun -j MASQUERADE -m comment --comment nordvpn"
        );
    }

    #[test]
    fn test_policy_and_chain_lines_are_skipped() {
        let listing = "-P FORWARD DROP\n-N DOCKER\n-A FORWARD -j DOCKER\n\n";
        let rules = ListedRule::parse_listing(Table::Filter, listing);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].comment, None);
    }

    #[test]
    fn test_tag_match_is_exact() {
        let listed = ListedRule::parse(
            Table::Filter,
            "-A FORWARD -s 10.0.0.0/8 -m comment --comment nordvpn-exitnode-transient-extra -j ACCEPT",
        )
        .unwrap();
        assert!(!listed.has_tag(Tag::ExitnodeTransient));

        let nat = ListedRule::parse(
            Table::Nat,
            "-A POSTROUTING -m comment --comment nordvpn-exitnode-transient -j MASQUERADE",
        )
        .unwrap();
        assert!(!nat.has_tag(Tag::Masquerade));
    }

    #[test]
    fn test_quoted_comment_is_unquoted() {
        let listed = ListedRule::parse(
            Table::Filter,
            r#"-A FORWARD -s 10.1.0.0/16 -m comment --comment "docker \"bridge\" rule" -j ACCEPT"#,
        )
        .unwrap();
        assert_eq!(listed.comment.as_deref(), Some(r#"docker "bridge" rule"#));
        assert_eq!(
            listed.to_string(),
            r#"-A FORWARD -s 10.1.0.0/16 -m comment --comment "docker \"bridge\" rule" -j ACCEPT"#
        );
    }

    #[test]
    fn test_rendered_rule_matches_its_own_listing() {
        let rule = Rule::forward(Target::Accept, Tag::AllowlistTransient)
            .destination(net("1.1.1.1/32"))
            .out_via("eth0");
        let listed = ListedRule::parse(Table::Filter, &rule.to_string()).unwrap();
        assert!(rule.matches_listed(&listed));
        assert!(listed.has_tag(Tag::AllowlistTransient));
    }

    proptest! {
        #[test]
        fn test_split_join_roundtrip(tokens in proptest::collection::vec("[a-zA-Z0-9 ./:\"-]{1,12}", 1..8)) {
            let line = join_tokens(&tokens);
            prop_assert_eq!(split_tokens(&line), tokens);
        }

        #[test]
        fn test_port_range_display(start in 1u16..=65535, len in 0u16..100) {
            let end = start.saturating_add(len);
            let text = PortRange { start, end }.to_string();
            if start == end {
                prop_assert_eq!(text, start.to_string());
            } else {
                prop_assert_eq!(text, format!("{start}:{end}"));
            }
        }
    }
}
