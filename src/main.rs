//! zonewall - zone-based iptables rule compiler
//!
//! Reads a YAML description of zones, policies and rules, compiles it into
//! `iptables-restore` / `ip6tables-restore` / `ipset restore` input and loads
//! it with a dead-man switch: unless the operator confirms within the
//! timeout, the previous state is restored.
//!
//! # Usage
//!
//! ```bash
//! zonewall compile                   # Print the compiled scripts
//! zonewall compile --family ip6      # Only the IPv6 script
//! zonewall check                     # Validate with iptables-restore --test
//! zonewall apply                     # Apply with 30s confirmation countdown
//! zonewall apply --timeout 120       # Longer countdown
//! zonewall apply --no-confirm        # Apply and persist immediately
//! zonewall rollback                  # Restore the last confirmed state
//! zonewall reset --family ip         # Accept-all, no rules, no ipsets
//! ```
//!
//! # Security
//!
//! - Backend tools are spawned directly when running as root, otherwise
//!   through run0/sudo/pkexec
//! - Names are validated before anything is compiled
//! - Audit trail of all privileged operations

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};
use zonewall::audit::{AuditLog, EventType};
use zonewall::config::{self, DEFAULT_CONFIG_PATH};
use zonewall::core::backend::CommandBackend;
use zonewall::core::compiler::{RuleCompiler, to_script};
use zonewall::core::error::RestoreErrorPattern;
use zonewall::core::ipsets::compile_ipsets;
use zonewall::core::transaction::{ConfirmOutcome, RestorePaths, Transaction};
use zonewall::core::verify::verify_rules;
use zonewall::prompt::TerminalPrompt;
use zonewall::{Config, Error, Family, Result, elevation, validators};

#[derive(Parser)]
#[command(name = "zonewall", version)]
#[command(about = "Zone-based iptables rule compiler with confirm-or-rollback apply", long_about = None)]
struct Cli {
    /// Firewall configuration document
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Defaults document merged underneath the configuration
    #[arg(long, value_name = "PATH")]
    defaults: Option<PathBuf>,

    /// Operate inside this network namespace (overrides settings.netns)
    #[arg(long, value_name = "NAME")]
    netns: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compiled restore scripts without applying them
    Compile {
        /// Only this address family (ip or ip6)
        #[arg(long)]
        family: Option<Family>,
        /// Print the ipset restore script instead
        #[arg(long, conflicts_with = "family")]
        ipsets: bool,
    },
    /// Compile and validate both families with `--test`
    Check,
    /// Apply the configuration, then wait for confirmation
    Apply {
        /// Confirmation timeout in seconds (default: settings.confirm_timeout_secs, max: 3600)
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,
        /// Persist immediately without waiting for confirmation
        #[arg(long, conflicts_with = "timeout")]
        no_confirm: bool,
    },
    /// Restore the last persisted state (or accept-all if none)
    Rollback,
    /// Remove all rules and ipsets, leaving accept-all policies
    Reset {
        /// Only this address family (ip or ip6)
        #[arg(long)]
        family: Option<Family>,
    },
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if quiet {
        tracing::Level::WARN
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(handle_cli(cli));
    // A pending stdin read must not keep the process alive
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");
    if let Some(stderr) = e.backend_stderr() {
        let translation = RestoreErrorPattern::match_error(stderr);
        eprintln!("{}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

fn note_elevation(restore_dir: Option<&std::path::Path>) {
    if !elevation::is_root() {
        println!("Note: Not running as root. Will use run0/sudo/pkexec for backend commands.");
        if let Some(dir) = restore_dir {
            println!("      Saved state in {} is accessed without elevation.", dir.display());
        }
    }
}

fn open_audit_log() -> Option<AuditLog> {
    match AuditLog::new() {
        Ok(audit) => Some(audit),
        Err(e) => {
            warn!("Audit log unavailable: {e}");
            None
        }
    }
}

fn transaction<'a>(
    config: &'a Config,
    backend: CommandBackend,
    paths: RestorePaths,
) -> Transaction<'a, CommandBackend> {
    let tx = Transaction::new(config, backend, paths);
    match open_audit_log() {
        Some(audit) => tx.with_audit(audit),
        None => tx,
    }
}

/// Rolls back a partial apply; returns the original error either way
async fn recover(tx: &mut Transaction<'_, CommandBackend>, e: Error) -> Error {
    if let Error::ApplyAborted { applied, .. } = &e
        && !applied.is_empty()
    {
        eprintln!("✗ Apply failed partway, rolling back...");
        match tx.rollback().await {
            Ok(()) => eprintln!("✓ Rolled back to previous state."),
            Err(rollback) => error!("Rollback after failed apply also failed: {rollback}"),
        }
    }
    e
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let defaults = config::resolve_defaults_path(cli.defaults).await;
    let document = config::load_document(&cli.config, defaults.as_deref()).await?;
    let mut settings = document.settings;
    if cli.netns.is_some() {
        settings.netns = cli.netns;
    }
    if let Some(netns) = &settings.netns {
        validators::validate_netns_name(netns).map_err(Error::Config)?;
    }
    validators::validate_config(&document.config)?;

    let config = &document.config;
    let backend =
        CommandBackend::new(settings.commands.clone()).with_netns(settings.netns.clone());
    let paths = RestorePaths::new(&settings.restore_dir, settings.netns.as_deref());

    match cli.command {
        Commands::Compile { family, ipsets } => {
            if ipsets {
                print!("{}", to_script(&compile_ipsets(config, false)?));
            } else {
                let compiler = RuleCompiler::new(config);
                let families = family.map_or_else(|| Family::ALL.to_vec(), |f| vec![f]);
                for (i, family) in families.into_iter().enumerate() {
                    if i > 0 {
                        println!();
                    }
                    println!("# {family}");
                    print!("{}", compiler.script(family)?);
                }
            }
        }
        Commands::Check => {
            note_elevation(None);
            let compiler = RuleCompiler::new(config);
            compile_ipsets(config, false)?;

            let audit = open_audit_log();
            let run_id = uuid::Uuid::new_v4();
            let mut rejected = Vec::new();

            for family in Family::ALL {
                let script = compiler.script(family)?;
                let result = verify_rules(&backend, family, &script).await?;
                if let Some(audit) = &audit {
                    audit
                        .record(
                            run_id,
                            EventType::Verify,
                            serde_json::json!({
                                "family": family.to_string(),
                                "sha256": zonewall::audit::checksum(&script),
                                "error_count": result.errors.len(),
                            }),
                            (!result.success).then(|| result.errors.join("; ")),
                        )
                        .await;
                }

                if result.success {
                    println!("✓ {family} rules verified");
                } else {
                    println!("✗ {family} rules rejected:");
                    for error in &result.errors {
                        println!("    {error}");
                    }
                    rejected.push(family.to_string());
                }
            }

            if !rejected.is_empty() {
                return Err(Error::Config(format!(
                    "verification failed for {}",
                    rejected.join(", ")
                )));
            }
        }
        Commands::Apply {
            timeout,
            no_confirm,
        } => {
            note_elevation(Some(&settings.restore_dir));
            if let Some(secs) = timeout {
                settings.confirm_timeout_secs = secs;
            }
            let mut tx = transaction(config, backend, paths);

            println!("Applying ruleset...");
            if no_confirm {
                if let Err(e) = tx.commit().await {
                    return Err(recover(&mut tx, e).await);
                }
                println!("✓ Rules applied and saved to {}.", settings.restore_dir.display());
                return Ok(());
            }

            if let Err(e) = tx.apply().await {
                return Err(recover(&mut tx, e).await);
            }
            println!("✓ Firewall rules applied!");
            println!();

            let mut prompt = TerminalPrompt;
            match tx.confirm(&mut prompt, settings.confirm_timeout()).await? {
                ConfirmOutcome::Confirmed => println!("\n✓ Changes confirmed and saved."),
                ConfirmOutcome::TimedOut => println!("\nTimeout - ✓ reverted to previous state."),
                ConfirmOutcome::Aborted => println!("\n✓ Reverted to previous state."),
            }
        }
        Commands::Rollback => {
            note_elevation(Some(&settings.restore_dir));
            let mut tx = transaction(config, backend, paths);
            tx.rollback().await?;
            println!("✓ Rolled back to last persisted state.");
        }
        Commands::Reset { family } => {
            note_elevation(None);
            let mut tx = transaction(config, backend, paths);
            tx.reset(family).await?;
            println!("✓ Firewall reset to accept-all.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["zonewall", "apply", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Apply { .. }));

        let cli = Cli::try_parse_from(["zonewall", "reset", "--quiet"]).unwrap();
        assert!(cli.quiet);

        assert!(Cli::try_parse_from(["zonewall", "-q", "check", "-v"]).is_err());
    }
}
