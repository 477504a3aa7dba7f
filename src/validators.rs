//! Static checks on configuration names
//!
//! The restore tools reject over-long or malformed names with an error that
//! points at a line number of the generated script. Checking the names up
//! front reports the offending zone, chain or set instead, and does it before
//! anything touches the kernel.

use crate::core::compiler::dispatcher_chain;
use crate::core::error::{Error, Result};
use crate::core::model::Config;

/// Kernel limit for interface names (IFNAMSIZ - 1)
pub const MAX_INTERFACE_LEN: usize = 15;

/// xtables limit for chain names (XT_EXTENSION_MAXNAMELEN - 1)
pub const MAX_CHAIN_LEN: usize = 28;

/// ipset limit for set names (IPSET_MAXNAMELEN - 1)
pub const MAX_IPSET_NAME_LEN: usize = 31;

/// Validates a network interface name as used in `-i` / `-o` matches.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only, plus a trailing `+` wildcard
/// - Cannot be "." or ".."
///
/// # Examples
///
/// ```
/// use zonewall::validators::validate_interface;
///
/// assert!(validate_interface("eth0").is_ok());
/// assert!(validate_interface("veth+").is_ok());
/// assert!(validate_interface("this-name-is-too-long").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "Interface name '{name}' too long (max {MAX_INTERFACE_LEN} characters)"
        ));
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(format!("Interface name '{name}' contains invalid characters"));
    }

    Ok(())
}

/// Validates a user-defined chain name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than [`MAX_CHAIN_LEN`],
/// contains whitespace or starts with `-`.
pub fn validate_chain_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_LEN {
        return Err(format!(
            "Chain name '{name}' too long (max {MAX_CHAIN_LEN} characters)"
        ));
    }

    if name.starts_with('-') || name.chars().any(char::is_whitespace) {
        return Err(format!("Chain name '{name}' is not a valid chain name"));
    }

    Ok(())
}

/// Validates an ipset name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long or contains whitespace.
pub fn validate_ipset_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Ipset name cannot be empty".to_string());
    }

    if name.len() > MAX_IPSET_NAME_LEN {
        return Err(format!(
            "Ipset name '{name}' too long (max {MAX_IPSET_NAME_LEN} characters)"
        ));
    }

    if name.chars().any(char::is_whitespace) {
        return Err(format!("Ipset name '{name}' contains whitespace"));
    }

    Ok(())
}

/// Validates a network namespace name for filesystem safety.
///
/// The name becomes a path segment under the restore directory, so:
/// - Alphanumeric, underscores, dots and hyphens only
/// - Max 64 chars
/// - Rejects "." and "..": path traversal protection
///
/// # Errors
///
/// Returns `Err` if the name could escape or break the restore directory.
pub fn validate_netns_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("Namespace name cannot be empty".to_string());
    }

    if name.len() > 64 {
        return Err("Namespace name too long (max 64 chars)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid namespace name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(format!(
            "Namespace name '{name}' contains invalid characters (use only a-z, 0-9, _, -, .)"
        ));
    }

    Ok(())
}

/// Checks every name in `config` and reports all problems at once.
///
/// # Errors
///
/// Returns [`Error::Config`] listing each invalid interface, chain or set name.
pub fn validate_config(config: &Config) -> Result<()> {
    let mut problems = Vec::new();

    for (zone, params) in &config.zones {
        for interface in &params.interfaces {
            if let Err(e) = validate_interface(interface) {
                problems.push(format!("zone '{zone}': {e}"));
            }
        }
        for chains in params.rules.values() {
            for chain in chains.keys() {
                if let Err(e) = validate_chain_name(&dispatcher_chain(zone, chain)) {
                    problems.push(format!("zone '{zone}': {e}"));
                }
            }
        }
    }

    for (table, chains) in &config.global.helper_chains {
        for chain in chains.keys() {
            if let Err(e) = validate_chain_name(chain) {
                problems.push(format!("helper chain in {table}: {e}"));
            }
        }
    }

    for name in config.ipsets.keys() {
        if let Err(e) = validate_ipset_name(name) {
            problems.push(e);
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(problems.join("; ")))
    }
}
