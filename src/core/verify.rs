/// Dry-run verification of compiled rule scripts
///
/// Feeds a script to `iptables-restore --test` (or the ip6 variant), which
/// parses and validates every line against the running kernel without
/// committing anything.
use crate::core::backend::CommandBackend;
use crate::core::error::{Result, Target};
use crate::core::model::Family;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error occurred at line:?\s*(\d+)").expect("line pattern is valid")
});

/// Result of a script verification
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
    /// 1-based line of the script the tool rejected, if it said so
    pub failed_line: Option<usize>,
}

impl VerifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            failed_line: None,
        }
    }

    pub fn failure(errors: Vec<String>, failed_line: Option<usize>) -> Self {
        Self {
            success: false,
            errors,
            failed_line,
        }
    }
}

/// Verifies `text` for `family` without applying it.
///
/// A rejected script is an `Ok` result with `success == false`; only failing
/// to run the tool at all is an `Err`.
///
/// # Errors
///
/// Returns `Err` if the restore command cannot be built or spawned.
pub async fn verify_rules(
    backend: &CommandBackend,
    family: Family,
    text: &str,
) -> Result<VerifyResult> {
    info!(%family, "verifying rules via restore --test");

    let output = backend
        .spawn_with_input(
            Target::Rules(family),
            backend.commands().restore(family),
            &["--test"],
            Some(text),
        )
        .await?;

    if output.status.success() {
        info!(%family, "rule verification passed");
        return Ok(VerifyResult::success());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(%family, "rule verification failed: {}", stderr.trim());

    let failed_line = parse_failed_line(&stderr);
    let mut errors = parse_restore_errors(&stderr);
    if let Some(line) = failed_line
        && let Some(content) = text.lines().nth(line.saturating_sub(1))
    {
        errors.push(format!("line {line}: {content}"));
    }

    Ok(VerifyResult::failure(errors, failed_line))
}

/// Extracts the `Error occurred at line: N` number
fn parse_failed_line(stderr: &str) -> Option<usize> {
    ERROR_LINE
        .captures(stderr)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Turns restore stderr into readable messages
///
/// Drops blank lines, the usage hint and the line marker (reported
/// separately), and strips the `iptables-restore v1.8.x (nf_tables): ` prefix.
fn parse_restore_errors(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("Try `"))
        .filter(|line| !ERROR_LINE.is_match(line))
        .map(|line| {
            let line = if line.contains("tables-restore") {
                line.split_once("): ")
                    .or_else(|| line.split_once(": "))
                    .map_or(line, |(_, rest)| rest)
            } else {
                line
            };
            line.to_string()
        })
        .collect()
}
