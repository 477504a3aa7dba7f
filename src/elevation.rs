//! Command construction and privilege elevation for backend tools
//!
//! Restoring or saving kernel state needs root (CAP_NET_ADMIN). zonewall is
//! normally run as root and then spawns the tools directly. When it is not,
//! the tool invocation is wrapped in an elevation helper.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **No terminal**: `pkexec`
//!
//! # Network namespaces
//!
//! With a namespace configured, the tool runs as
//! `ip netns exec <ns> <tool> ...`, and the elevation helper (if any) wraps
//! the whole `ip` invocation.
//!
//! # Environment Variables
//!
//! - `ZONEWALL_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//! - `ZONEWALL_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! Commands are constructed as argument vectors, never through a shell.

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// A configured command line has no program
    #[error("Empty command line configured")]
    EmptyCommand,

    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `ZONEWALL_ELEVATION_METHOD`
    #[error("Invalid ZONEWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Whether the current process can talk to the packet filter without help
pub fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

/// Full argument vector for a tool: namespace wrapper, configured argv, extra args
fn tool_argv(argv: &[String], extra: &[&str], netns: Option<&str>) -> Vec<String> {
    let mut full = Vec::with_capacity(argv.len() + extra.len() + 4);
    if let Some(ns) = netns {
        full.extend(["ip", "netns", "exec", ns].map(String::from));
    }
    full.extend(argv.iter().cloned());
    full.extend(extra.iter().map(|s| (*s).to_string()));
    full
}

fn wrapped(helper: &str, argv: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.args(argv);
    cmd
}

fn direct(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Creates a command for a backend tool, elevated if necessary.
///
/// `argv` is the configured command line (program plus leading arguments),
/// `extra` is appended after it.
///
/// # Errors
///
/// - [`ElevationError::EmptyCommand`] if `argv` is empty
/// - [`ElevationError::InvalidMethod`] / [`ElevationError::MethodNotAvailable`]
///   for a bad `ZONEWALL_ELEVATION_METHOD`
/// - [`ElevationError::PkexecNotFound`] when no elevation helper is usable
pub fn create_elevated_command(
    argv: &[String],
    extra: &[&str],
    netns: Option<&str>,
) -> Result<Command, ElevationError> {
    if argv.is_empty() {
        return Err(ElevationError::EmptyCommand);
    }
    let full = tool_argv(argv, extra, netns);

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("ZONEWALL_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(&full));
    }

    // 2. Direct Root Execution (No prompt needed)
    if is_root() {
        return Ok(direct(&full));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("ZONEWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, &full))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", &full));
    }

    let is_atty = {
        use std::os::fd::AsFd;
        nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false)
    };

    if is_atty {
        Ok(wrapped("sudo", &full))
    } else if binary_exists("pkexec") {
        Ok(wrapped("pkexec", &full))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}
