//! Shared test utilities for core module tests
//!
//! Provides in-memory stand-ins for the `iptables` binary and the kernel
//! toggle so engine tests never touch the host ruleset or require root.
//! This module is only compiled in test mode.

use crate::core::error::{Error, MISSING_RULE_MESSAGE, Result};
use crate::core::executor::{CommandExecutor, command_line};
use crate::core::kernel::{IPV4_FORWARD, SysctlSetter};
use crate::core::model::Peer;
use crate::core::rule::{ListedRule, Table, Tag, join_tokens, split_tokens};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use strum::IntoEnumIterator;

/// Creates a peer from a bare address.
pub fn peer(address: &str, routing: bool, local_network: bool) -> Peer {
    Peer::new(
        address.parse().expect("test peer address"),
        routing,
        local_network,
    )
}

fn failure(command: String, output: &str) -> Error {
    Error::Execution {
        command,
        output: output.to_string(),
        exit_code: Some(1),
    }
}

#[derive(Debug, Default)]
struct FakeState {
    /// (table, chain) -> rule specs, top of the chain first
    chains: BTreeMap<(String, String), Vec<Vec<String>>>,
    commands: Vec<String>,
    /// (argument substring, tool output) pairs that make a command fail
    failures: Vec<(String, String)>,
}

/// Stateful in-memory `iptables`.
///
/// Understands `-t`, `-S`, `-I [n]`, `-A` and `-D`. Rules are stored as the
/// token lists they were added with and listed back verbatim, so deletion by
/// listing works the way it does against the real tool. Deleting an absent
/// rule fails with the real "Bad rule" message.
#[derive(Debug, Default)]
pub struct FakeIptables {
    state: Mutex<FakeState>,
}

impl FakeIptables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a pre-existing rule written in `-A CHAIN ...` form.
    pub fn seed(&self, table: &str, line: &str) {
        let mut tokens = split_tokens(line).into_iter();
        assert_eq!(tokens.next().as_deref(), Some("-A"), "seed lines use -A");
        let chain = tokens.next().expect("seed line names a chain");
        let mut state = self.state.lock().unwrap();
        state
            .chains
            .entry((table.to_string(), chain))
            .or_default()
            .push(tokens.collect());
    }

    /// Makes every command whose arguments contain `pattern` fail with `output`.
    pub fn fail_when(&self, pattern: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Commands issued so far, `iptables` prefix included.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    /// Rules of a chain in `-A` form, top of the chain first.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .map(|rules| {
                rules
                    .iter()
                    .map(|spec| format!("-A {chain} {}", join_tokens(spec)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every rule in any chain whose comment is one of meshgate's tags.
    pub fn owned_rules(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .chains
            .iter()
            .flat_map(|((_, chain), rules)| {
                rules
                    .iter()
                    .map(move |spec| format!("-A {chain} {}", join_tokens(spec)))
            })
            .filter(|line| {
                ListedRule::parse(Table::Filter, line)
                    .is_some_and(|rule| Tag::iter().any(|tag| rule.has_tag(tag)))
            })
            .collect()
    }

    /// Number of rules in a chain carrying `tag`.
    pub fn count_tagged(&self, table: &str, chain: &str, tag: Tag) -> usize {
        self.rules(table, chain)
            .iter()
            .filter_map(|line| ListedRule::parse(Table::Filter, line))
            .filter(|rule| rule.has_tag(tag))
            .count()
    }
}

impl CommandExecutor for FakeIptables {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let line = command_line(program, args);
        let joined = args.join(" ");
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("fake iptables poisoned".into()))?;
        state.commands.push(line.clone());

        if let Some((_, output)) = state.failures.iter().find(|(p, _)| joined.contains(p.as_str())) {
            return Err(failure(line, output));
        }

        let mut rest = args;
        let mut table = "filter".to_string();
        if rest.first().map(String::as_str) == Some("-t") && rest.len() >= 2 {
            table = rest[1].clone();
            rest = &rest[2..];
        }
        let (Some(flag), Some(chain)) = (rest.first(), rest.get(1)) else {
            return Err(failure(line, "iptables: missing command or chain"));
        };
        let key = (table, chain.clone());
        let spec = &rest[2..];

        match flag.as_str() {
            "-S" => {
                let mut out = format!("-P {chain} ACCEPT\n");
                for rule in state.chains.get(&key).into_iter().flatten() {
                    out.push_str(&format!("-A {chain} {}\n", join_tokens(rule)));
                }
                Ok(out.into_bytes())
            }
            "-A" => {
                state.chains.entry(key).or_default().push(spec.to_vec());
                Ok(Vec::new())
            }
            "-I" => {
                let (position, spec) = match spec.first().and_then(|s| s.parse::<usize>().ok()) {
                    Some(n) => (n.saturating_sub(1), &spec[1..]),
                    None => (0, spec),
                };
                let rules = state.chains.entry(key).or_default();
                let position = position.min(rules.len());
                rules.insert(position, spec.to_vec());
                Ok(Vec::new())
            }
            "-D" => {
                let rules = state.chains.entry(key).or_default();
                match rules.iter().position(|r| r.as_slice() == spec) {
                    Some(index) => {
                        rules.remove(index);
                        Ok(Vec::new())
                    }
                    None => Err(failure(line, &format!("iptables: {MISSING_RULE_MESSAGE}.\n"))),
                }
            }
            other => Err(failure(line, &format!("unsupported flag {other}"))),
        }
    }
}

/// Records commands and serves canned output, without any rule state.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    outputs: Vec<(String, String)>,
    failures: Vec<(String, String)>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose arguments contain `pattern` succeed with `output`.
    pub fn with_output(mut self, pattern: &str, output: &str) -> Self {
        self.outputs.push((pattern.to_string(), output.to_string()));
        self
    }

    /// Commands whose arguments contain `pattern` fail with `output`.
    pub fn with_failure(mut self, pattern: &str, output: &str) -> Self {
        self.failures.push((pattern.to_string(), output.to_string()));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let line = command_line(program, args);
        let joined = args.join(" ");
        self.commands
            .lock()
            .map_err(|_| Error::Internal("recording executor poisoned".into()))?
            .push(line.clone());

        if let Some((_, output)) = self.failures.iter().find(|(p, _)| joined.contains(p.as_str())) {
            return Err(failure(line, output));
        }
        Ok(self
            .outputs
            .iter()
            .find(|(p, _)| joined.contains(p.as_str()))
            .map(|(_, output)| output.clone().into_bytes())
            .unwrap_or_default())
    }
}

/// What a [`MockSysctl`] has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysctlCalls {
    pub set: usize,
    pub unset: usize,
    pub forwarding: bool,
}

/// Kernel toggle double. Clones share their call log.
#[derive(Debug, Clone, Default)]
pub struct MockSysctl {
    calls: Arc<Mutex<SysctlCalls>>,
    failing: bool,
}

impl MockSysctl {
    /// A toggle whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> SysctlCalls {
        *self.calls.lock().unwrap()
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            Err(Error::Sysctl {
                param: IPV4_FORWARD.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only file system",
                ),
            })
        } else {
            Ok(())
        }
    }
}

impl SysctlSetter for MockSysctl {
    fn set(&mut self) -> Result<()> {
        self.calls.lock().unwrap().set += 1;
        self.check()?;
        self.calls.lock().unwrap().forwarding = true;
        Ok(())
    }

    fn unset(&mut self) -> Result<()> {
        self.calls.lock().unwrap().unset += 1;
        self.check()?;
        self.calls.lock().unwrap().forwarding = false;
        Ok(())
    }
}
