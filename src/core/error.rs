use crate::core::model::{Family, Table};
use std::fmt;
use thiserror::Error;

/// What a backend operation was acting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Rule tables of one address family
    Rules(Family),
    /// The (family-independent) ipsets
    Ipsets,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Rules(family) => write!(f, "{family} rules"),
            Target::Ipsets => write!(f, "ipsets"),
        }
    }
}

/// Core error types for zonewall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration document could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration is malformed or exceeds a static limit
    #[error("Configuration error: {0}")]
    Config(String),

    /// An ipset definition lacks a required field
    #[error("Ipset '{ipset}' is missing required field '{field}'")]
    MissingField { ipset: String, field: &'static str },

    #[error("Undefined variable '{name}' in rule: {rule}")]
    UndefinedVariable { name: String, rule: String },

    #[error("Undefined zone '{name}' in rule: {rule}")]
    UndefinedZone { name: String, rule: String },

    /// Placeholder expansion did not terminate (self-referencing variable or zone)
    #[error("Expansion of '{placeholder}' does not terminate in rule: {rule}")]
    ExpansionLimit { placeholder: String, rule: String },

    /// Zone declares rules under a chain that is not a built-in hook
    #[error("Zone '{zone}' declares rules for {table} chain '{chain}', which is not a built-in chain")]
    InvalidChain {
        zone: String,
        table: Table,
        chain: String,
    },

    /// Restore or save command failed
    #[error("Backend error ({target}): {message}")]
    Backend {
        target: Target,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Apply stopped partway; `applied` lists what already reached the kernel
    #[error("Apply aborted after {} step(s): {source}", .applied.len())]
    ApplyAborted {
        applied: Vec<Target>,
        #[source]
        source: Box<Error>,
    },

    /// One or more rollback steps failed
    #[error("Rollback failed: {}", .failures.join("; "))]
    RollbackFailed { failures: Vec<String> },

    /// Transaction operation called from the wrong state
    #[error("Cannot {operation} while transaction is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Backend stderr, looking through an aborted apply
    pub fn backend_stderr(&self) -> Option<&str> {
        match self {
            Error::Backend { stderr, .. } => stderr.as_deref(),
            Error::ApplyAborted { source, .. } => source.backend_stderr(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables-restore / ipset failure patterns
pub struct RestoreErrorPattern;

impl RestoreErrorPattern {
    /// Matches backend stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or set ZONEWALL_ELEVATION_METHOD=sudo")
                .with_suggestion("Check that CAP_NET_ADMIN is available in this namespace");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables or ipset is not installed or not in PATH")
                .with_suggestion("Install iptables and ipset: sudo apt install iptables ipset  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables ipset  (Fedora/RHEL)")
                .with_suggestion("Or override the commands in the `settings.commands` section");
        }

        if lower.contains("xtables lock") || lower.contains("holding the xtables lock") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Wait for the other firewall tool to finish and try again")
                .with_suggestion("Add `-w` to the restore command in `settings.commands`");
        }

        if lower.contains("set") && lower.contains("in use") {
            return ErrorTranslation::new("An ipset is still referenced by a rule")
                .with_suggestion("Sets in use cannot be destroyed or recreated with a new type")
                .with_suggestion("Run `zonewall reset` first, then apply again");
        }

        if lower.contains("set") && lower.contains("doesn't exist") {
            return ErrorTranslation::new("A rule references an ipset that does not exist")
                .with_suggestion("Declare the set under `ipsets` in the configuration")
                .with_suggestion("Check the set name for typos");
        }

        if lower.contains("couldn't load target") || lower.contains("couldn't load match") {
            return ErrorTranslation::new("Unknown target, match or chain in a rule")
                .with_suggestion("Jump targets must be built-in targets or declared helper chains")
                .with_suggestion("Check that the needed kernel module (xt_*) is available");
        }

        if lower.contains("chain") && lower.contains("does not exist") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Declare custom chains under `global.helper_chains`");
        }

        if lower.contains("line") && lower.contains("failed") {
            return ErrorTranslation::new("A rule line was rejected by the restore tool")
                .with_suggestion("Run `zonewall compile` and inspect the reported line number")
                .with_suggestion("Run `zonewall check` to validate without applying");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables works: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
