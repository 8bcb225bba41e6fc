//! External command execution
//!
//! meshgate never manipulates netfilter directly. Every change goes through the
//! `iptables` binary, invoked synchronously with an argument vector built from
//! validated data. [`CommandExecutor`] is the seam: production code uses
//! [`SystemExecutor`], `meshgate plan` uses [`DryRunExecutor`], and tests use
//! in-memory fakes.
//!
//! # Security
//!
//! - Commands are spawned without a shell, so no argument is ever interpolated
//! - Only the `iptables` program name is ever requested by the engine
//! - The binary path can be pinned through configuration

use crate::core::error::{Error, Result};
use crate::core::rule::{ListedRule, Operation, Rule, Table};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Program name the engine invokes.
pub const IPTABLES: &str = "iptables";

/// Runs one external command to completion.
///
/// On success returns the combined stdout and stderr. A non-zero exit status is
/// reported as [`Error::Execution`] carrying the same combined output.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for Arc<T> {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        (**self).execute(program, args)
    }
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for &T {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        (**self).execute(program, args)
    }
}

impl<T: CommandExecutor + ?Sized> CommandExecutor for Box<T> {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        (**self).execute(program, args)
    }
}

/// Formats a command line for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Spawns real processes with `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    iptables_path: Option<PathBuf>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `path` whenever the engine asks for `iptables`.
    pub fn with_iptables_path(path: impl Into<PathBuf>) -> Self {
        Self {
            iptables_path: Some(path.into()),
        }
    }

    fn resolve(&self, program: &str) -> PathBuf {
        match self.iptables_path {
            Some(ref path) if program == IPTABLES => path.clone(),
            _ => PathBuf::from(program),
        }
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let resolved = self.resolve(program);
        let output = std::process::Command::new(&resolved)
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                program: resolved.display().to_string(),
                source,
            })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(Error::Execution {
                command: command_line(program, args),
                output: String::from_utf8_lossy(&combined).trim_end().to_string(),
                exit_code: output.status.code(),
            })
        }
    }
}

/// Records commands instead of running them.
///
/// Listings come back empty, so a plan made with this executor shows the full
/// sequence a resync would issue against a ruleset that owns nothing yet.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    commands: Mutex<Vec<String>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl CommandExecutor for DryRunExecutor {
    fn execute(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let mut commands = self
            .commands
            .lock()
            .map_err(|_| Error::Internal("dry-run command log poisoned".to_string()))?;
        commands.push(command_line(program, args));
        Ok(Vec::new())
    }
}

/// Thin typed front-end over an executor for the `iptables` program.
#[derive(Debug, Clone)]
pub struct Iptables<E> {
    executor: E,
}

impl<E: CommandExecutor> Iptables<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Runs `iptables` with raw arguments.
    pub fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        debug!("{}", command_line(IPTABLES, args));
        self.executor.execute(IPTABLES, args)
    }

    /// Inserts `rule` at the head of its chain.
    pub fn insert(&self, rule: &Rule) -> Result<()> {
        self.run(&rule.render(Operation::Insert(None))).map(drop)
    }

    /// Inserts `rule` at a 1-based position in its chain.
    pub fn insert_at(&self, rule: &Rule, position: u32) -> Result<()> {
        self.run(&rule.render(Operation::Insert(Some(position))))
            .map(drop)
    }

    pub fn append(&self, rule: &Rule) -> Result<()> {
        self.run(&rule.render(Operation::Append)).map(drop)
    }

    pub fn delete(&self, rule: &Rule) -> Result<()> {
        self.run(&rule.render(Operation::Delete)).map(drop)
    }

    /// Deletes `rule`, treating "no such rule" as success.
    ///
    /// Returns whether a rule was actually removed.
    pub fn delete_if_present(&self, rule: &Rule) -> Result<bool> {
        match self.delete(rule) {
            Ok(()) => Ok(true),
            Err(e) if e.is_missing_rule() => {
                debug!("rule already absent: {rule}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Lists the rules of `chain` in `table` in evaluation order.
    pub fn list(&self, table: Table, chain: &str) -> Result<Vec<ListedRule>> {
        let args = vec![
            "-t".to_string(),
            table.to_string(),
            "-S".to_string(),
            chain.to_string(),
        ];
        let output = self.run(&args)?;
        Ok(ListedRule::parse_listing(
            table,
            &String::from_utf8_lossy(&output),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Tag, Target};

    #[test]
    fn test_command_line_formatting() {
        assert_eq!(command_line("iptables", &[]), "iptables");
        assert_eq!(
            command_line("iptables", &["-S".to_string(), "FORWARD".to_string()]),
            "iptables -S FORWARD"
        );
    }

    #[test]
    fn test_dry_run_records_in_order() {
        let dry = DryRunExecutor::new();
        let ipt = Iptables::new(&dry);
        let rule = Rule::forward(Target::Drop, Tag::ExitnodeTransient).out_via("eth0");

        assert!(ipt.list(Table::Filter, "FORWARD").unwrap().is_empty());
        ipt.insert(&rule).unwrap();
        ipt.delete(&rule).unwrap();

        assert_eq!(
            dry.commands(),
            vec![
                "iptables -t filter -S FORWARD",
                "iptables -t filter -I FORWARD -o eth0 -m comment --comment nordvpn-exitnode-transient -j DROP",
                "iptables -t filter -D FORWARD -o eth0 -m comment --comment nordvpn-exitnode-transient -j DROP",
            ]
        );
    }

    #[test]
    fn test_system_executor_path_override_only_for_iptables() {
        let exec = SystemExecutor::with_iptables_path("/usr/sbin/iptables-legacy");
        assert_eq!(
            exec.resolve(IPTABLES),
            PathBuf::from("/usr/sbin/iptables-legacy")
        );
        assert_eq!(exec.resolve("true"), PathBuf::from("true"));
    }

    #[test]
    fn test_system_executor_reports_spawn_failure() {
        let exec = SystemExecutor::new();
        let err = exec
            .execute("/nonexistent/meshgate-test-binary", &[])
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_nonzero_exit_is_execution_error() {
        let exec = SystemExecutor::new();
        let err = exec.execute("false", &[]).unwrap_err();
        match err {
            Error::Execution { exit_code, .. } => assert_eq!(exit_code, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
