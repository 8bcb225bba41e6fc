use thiserror::Error;

/// Text iptables prints when asked to delete a rule that is not in the chain.
pub const MISSING_RULE_MESSAGE: &str = "Bad rule (does a matching rule exist in that chain?)";

/// Core error types for meshgate
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The external tool ran and reported failure
    #[error("{command} failed: {output}")]
    Execution {
        command: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// The external tool could not be started at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Allowlist subnet or peer prefix did not parse
    #[error("invalid subnet '{value}': {reason}")]
    InvalidSubnet { value: String, reason: String },

    /// Allowlist port out of range
    #[error("invalid port {port}: {reason}")]
    InvalidPort { port: u32, reason: String },

    /// Interface name violates kernel naming rules
    #[error("invalid interface '{name}': {reason}")]
    InvalidInterface { name: String, reason: String },

    /// Kernel parameter could not be read or written
    #[error("kernel parameter {param}: {source}")]
    Sysctl {
        param: String,
        #[source]
        source: std::io::Error,
    },

    /// A lower level error annotated with what was being attempted
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Every failure collected while tearing the ruleset down
    #[error("teardown incomplete: {}", join_errors(.0))]
    Teardown(Vec<Error>),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Wraps `self` with a description of the step that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error beneath any `Context` layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the tool refused a deletion because the rule was not there.
    ///
    /// Resynchronisation can run against a chain that an earlier failed attempt
    /// already cleared half way, so callers treat this as success.
    pub fn is_missing_rule(&self) -> bool {
        match self.root() {
            Error::Execution { output, .. } => output.contains(MISSING_RULE_MESSAGE),
            _ => false,
        }
    }
}

/// Adds `.context()` to `Result` so call sites read like the step they perform.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run meshgate as root or with CAP_NET_ADMIN")
                .with_suggestion("Check that the daemon was not started as an unprivileged user")
                .with_help("https://man7.org/linux/man-pages/man7/capabilities.7.html");
        }

        // Another process holds the xtables lock
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is modifying iptables")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: systemctl status firewalld ufw",
                );
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or set `iptables_path` in the meshgate config");
        }

        // Deleting a rule that is already gone
        if msg.contains(MISSING_RULE_MESSAGE) {
            return ErrorTranslation::new("Rule was already removed from the chain")
                .with_suggestion("Another tool may have flushed the chain")
                .with_suggestion("Run `meshgate reset` to rebuild the ruleset from scratch");
        }

        // Unknown chain, target or match module
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match extension not available")
                .with_suggestion("Load the netfilter modules: modprobe iptable_nat xt_comment xt_conntrack")
                .with_suggestion("Check the kernel supports MASQUERADE: lsmod | grep nf_nat")
                .with_help("https://www.netfilter.org/documentation/");
        }

        // Bad argument (malformed address, port or interface)
        if lower.contains("bad argument") || lower.contains("invalid") {
            return ErrorTranslation::new("iptables rejected a rule argument")
                .with_suggestion("Check allowlisted subnets use CIDR notation: 192.168.1.0/24")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the live ruleset: sudo iptables -S FORWARD")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
