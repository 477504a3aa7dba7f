//! Ipset restore script generation
//!
//! Ipsets are shared by both address families and are restored through
//! `ipset restore` before any rule that references them. Entries go through
//! variable substitution only; zone placeholders have no meaning in a set.

use crate::core::error::{Error, Result};
use crate::core::expand::Expander;
use crate::core::model::Config;

/// Restore lines that empty and remove every set
pub const RESET_LINES: [&str; 2] = ["flush", "destroy"];

/// Builds the `ipset restore` input for `config`.
///
/// With `reset` the output is exactly [`RESET_LINES`]. Otherwise each set
/// contributes a `-exist create`, a `flush` and one `add` per entry, in
/// declaration order.
///
/// # Errors
///
/// - [`Error::MissingField`] if a set has no `type` or no `entries`
/// - [`Error::UndefinedVariable`] / [`Error::ExpansionLimit`] from entry substitution
pub fn compile_ipsets(config: &Config, reset: bool) -> Result<Vec<String>> {
    if reset {
        return Ok(RESET_LINES.iter().map(ToString::to_string).collect());
    }

    let expander = Expander::new(config);
    let mut lines = Vec::new();

    for (name, ipset) in &config.ipsets {
        let set_type = ipset.set_type.as_deref().ok_or_else(|| Error::MissingField {
            ipset: name.clone(),
            field: "type",
        })?;
        let entries = ipset.entries.as_ref().ok_or_else(|| Error::MissingField {
            ipset: name.clone(),
            field: "entries",
        })?;

        match ipset.options.as_deref().map(str::trim) {
            Some(options) if !options.is_empty() => {
                lines.push(format!("-exist create {name} {set_type} {options}"));
            }
            _ => lines.push(format!("-exist create {name} {set_type}")),
        }
        lines.push(format!("flush {name}"));

        for entry in entries {
            let entry = expander.substitute_variables(entry)?;
            lines.push(format!("add {name} {entry}"));
        }
    }

    Ok(lines)
}

/// Adds a `flush <set>` after every `create` line of `ipset save` output.
///
/// Replayed with `-exist`, a saved file alone would keep members added since
/// the save; flushing first leaves each saved set with exactly its saved members.
pub fn flush_saved_sets(saved: &str) -> String {
    let mut script = String::with_capacity(saved.len());
    for line in saved.lines() {
        script.push_str(line);
        script.push('\n');
        if let Some(name) = line
            .strip_prefix("create ")
            .and_then(|rest| rest.split_whitespace().next())
        {
            script.push_str("flush ");
            script.push_str(name);
            script.push('\n');
        }
    }
    script
}
