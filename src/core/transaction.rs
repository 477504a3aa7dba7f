//! Apply, confirm, persist or roll back
//!
//! A [`Transaction`] owns one run against the packet filter:
//!
//! ```text
//! Idle --apply--> Applied --confirm(Confirmed)--> Confirmed
//!                    |
//!                    +--confirm(TimedOut | Aborted)--> RolledBack
//! ```
//!
//! Everything is compiled before the first backend call, so a configuration
//! error never leaves the kernel half-updated. Rollback only replays what was
//! persisted by an earlier confirmed run (or resets to accept-all when there
//! is nothing persisted); it never looks at the configuration being applied.

use crate::audit::{AuditLog, EventType, checksum};
use crate::core::backend::RulesetBackend;
use crate::core::compiler::{RuleCompiler, to_script};
use crate::core::error::{Error, Result, Target};
use crate::core::ipsets::{RESET_LINES, compile_ipsets};
use crate::core::model::{Config, Family};
use crate::utils::namespaced_dir;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::Display;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const IPSET_RESTORE_FILE: &str = "ipsets.restore";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransactionState {
    Idle,
    Applied,
    Confirmed,
    #[strum(serialize = "rolled back")]
    RolledBack,
}

/// How the wait for the operator ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    TimedOut,
    Aborted,
}

/// Waits for the operator to confirm that connectivity survived
#[allow(async_fn_in_trait)]
pub trait Confirmation {
    /// Resolves within `timeout` (as [`ConfirmOutcome::TimedOut`] at the latest)
    async fn wait(&mut self, timeout: Duration) -> ConfirmOutcome;
}

/// Persisted restore files for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePaths {
    pub ip: PathBuf,
    pub ip6: PathBuf,
    pub ipset: PathBuf,
}

impl RestorePaths {
    pub fn new(base: &Path, netns: Option<&str>) -> Self {
        let dir = namespaced_dir(base, netns);
        Self {
            ip: dir.join(Family::Ip.restore_file_name()),
            ip6: dir.join(Family::Ip6.restore_file_name()),
            ipset: dir.join(IPSET_RESTORE_FILE),
        }
    }

    pub fn rules(&self, family: Family) -> &Path {
        match family {
            Family::Ip => &self.ip,
            Family::Ip6 => &self.ip6,
        }
    }
}

/// Whether a saved file exists at `path`.
///
/// A path that cannot be checked is an error, never "nothing saved": falling
/// back to accept-all would silently drop the last confirmed state.
async fn is_persisted(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("cannot check saved state {}: {e}", path.display()),
        ))
    })
}

/// Everything `apply` sends to the backend, compiled up front
struct CompiledScripts {
    ipsets: String,
    ip: String,
    ip6: String,
}

impl CompiledScripts {
    fn rules(&self, family: Family) -> &str {
        match family {
            Family::Ip => &self.ip,
            Family::Ip6 => &self.ip6,
        }
    }
}

pub struct Transaction<'a, B: RulesetBackend> {
    config: &'a Config,
    backend: B,
    paths: RestorePaths,
    state: TransactionState,
    run_id: Uuid,
    audit: Option<AuditLog>,
}

impl<'a, B: RulesetBackend> Transaction<'a, B> {
    pub fn new(config: &'a Config, backend: B, paths: RestorePaths) -> Self {
        Self {
            config,
            backend,
            paths,
            state: TransactionState::Idle,
            run_id: Uuid::new_v4(),
            audit: None,
        }
    }

    /// Records every operation in `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn paths(&self) -> &RestorePaths {
        &self.paths
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn require(&self, operation: &'static str, allowed: &[TransactionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    async fn audit(&self, event: EventType, details: serde_json::Value, error: Option<String>) {
        if let Some(audit) = &self.audit {
            audit.record(self.run_id, event, details, error).await;
        }
    }

    fn compile(&self) -> Result<CompiledScripts> {
        let compiler = RuleCompiler::new(self.config);
        Ok(CompiledScripts {
            ipsets: to_script(&compile_ipsets(self.config, false)?),
            ip: compiler.script(Family::Ip)?,
            ip6: compiler.script(Family::Ip6)?,
        })
    }

    /// Compiles the configuration and loads it: ipsets, then ip, then ip6.
    ///
    /// # Errors
    ///
    /// - Compile errors, before anything reaches the backend
    /// - [`Error::ApplyAborted`] when a backend step fails; `applied` lists
    ///   the targets already loaded. Nothing is rolled back here.
    pub async fn apply(&mut self) -> Result<()> {
        self.require("apply", &[TransactionState::Idle])?;

        let scripts = match self.compile() {
            Ok(scripts) => scripts,
            Err(e) => {
                self.audit(EventType::Apply, serde_json::json!({"stage": "compile"}), Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let details = serde_json::json!({
            "ipsets_sha256": checksum(&scripts.ipsets),
            "ip_sha256": checksum(&scripts.ip),
            "ip6_sha256": checksum(&scripts.ip6),
        });

        info!(run_id = %self.run_id, "applying compiled rules");
        let mut applied = Vec::new();

        let mut outcome = self
            .backend
            .restore_ipsets_from_text(&scripts.ipsets)
            .await
            .map(|()| applied.push(Target::Ipsets));

        for family in Family::ALL {
            if outcome.is_err() {
                break;
            }
            outcome = self
                .backend
                .restore_from_text(family, scripts.rules(family))
                .await
                .map(|()| applied.push(Target::Rules(family)));
        }

        if let Err(source) = outcome {
            error!(applied = applied.len(), "apply aborted: {source}");
            if !applied.is_empty() {
                self.state = TransactionState::Applied;
            }
            let err = Error::ApplyAborted {
                applied,
                source: Box::new(source),
            };
            self.audit(EventType::Apply, details, Some(err.to_string())).await;
            return Err(err);
        }

        self.state = TransactionState::Applied;
        info!(run_id = %self.run_id, "rules applied");
        self.audit(EventType::Apply, details, None).await;
        Ok(())
    }

    /// Waits for confirmation; persists on [`ConfirmOutcome::Confirmed`],
    /// rolls back otherwise.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless applied, then any persist or rollback error.
    pub async fn confirm<C: Confirmation>(
        &mut self,
        prompt: &mut C,
        timeout: Duration,
    ) -> Result<ConfirmOutcome> {
        self.require("confirm", &[TransactionState::Applied])?;

        info!(timeout_secs = timeout.as_secs(), "waiting for confirmation");
        let outcome = prompt.wait(timeout).await;

        let error = (outcome != ConfirmOutcome::Confirmed).then(|| format!("not confirmed: {outcome}"));
        self.audit(
            EventType::Confirm,
            serde_json::json!({"outcome": outcome.to_string(), "timeout_secs": timeout.as_secs()}),
            error,
        )
        .await;

        match outcome {
            ConfirmOutcome::Confirmed => {
                info!("changes confirmed");
                self.persist().await?;
                self.state = TransactionState::Confirmed;
            }
            ConfirmOutcome::TimedOut | ConfirmOutcome::Aborted => {
                warn!(%outcome, "changes not confirmed, rolling back");
                self.rollback().await?;
            }
        }

        Ok(outcome)
    }

    /// Saves live ipsets and rule tables to the restore files.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless applied, then the first failing save.
    pub async fn persist(&mut self) -> Result<()> {
        self.require(
            "persist",
            &[TransactionState::Applied, TransactionState::Confirmed],
        )?;

        let result = self.save_all().await;
        self.audit(
            EventType::Persist,
            serde_json::json!({
                "ipsets": self.paths.ipset,
                "ip": self.paths.ip,
                "ip6": self.paths.ip6,
            }),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
        result
    }

    async fn save_all(&self) -> Result<()> {
        self.backend.save_ipsets_to_file(&self.paths.ipset).await?;
        for family in Family::ALL {
            self.backend
                .save_to_file(family, self.paths.rules(family))
                .await?;
        }
        info!("persisted live state");
        Ok(())
    }

    /// Restores the last persisted state, or accept-all where none exists.
    ///
    /// Every step runs even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] after a confirmed run
    /// - [`Error::RollbackFailed`] listing each failed step
    pub async fn rollback(&mut self) -> Result<()> {
        self.require(
            "rollback",
            &[TransactionState::Idle, TransactionState::Applied],
        )?;

        warn!(run_id = %self.run_id, "rolling back");
        let mut failures = Vec::new();
        let mut steps = Vec::new();

        for family in Family::ALL {
            let path = self.paths.rules(family);
            let (source, result) = match is_persisted(path).await {
                Ok(true) => ("persisted", self.backend.restore_from_file(family, path).await),
                Ok(false) => {
                    debug!(%family, "nothing persisted, resetting");
                    let result = match RuleCompiler::reset_script(family) {
                        Ok(script) => self.backend.restore_from_text(family, &script).await,
                        Err(e) => Err(e),
                    };
                    ("reset", result)
                }
                Err(e) => ("unreadable", Err(e)),
            };
            steps.push(serde_json::json!({"target": Target::Rules(family).to_string(), "source": source}));
            if let Err(e) = result {
                error!(%family, "rollback step failed: {e}");
                failures.push(format!("{}: {e}", Target::Rules(family)));
            }
        }

        let (source, result) = match is_persisted(&self.paths.ipset).await {
            Ok(true) => (
                "persisted",
                self.backend
                    .restore_ipsets_from_file(&self.paths.ipset)
                    .await,
            ),
            Ok(false) => {
                let script = to_script(&RESET_LINES.map(String::from));
                ("reset", self.backend.restore_ipsets_from_text(&script).await)
            }
            Err(e) => ("unreadable", Err(e)),
        };
        steps.push(serde_json::json!({"target": Target::Ipsets.to_string(), "source": source}));
        if let Err(e) = result {
            error!("ipset rollback step failed: {e}");
            failures.push(format!("{}: {e}", Target::Ipsets));
        }

        self.state = TransactionState::RolledBack;

        if failures.is_empty() {
            info!("rollback complete");
            self.audit(EventType::Rollback, serde_json::json!({"steps": steps}), None)
                .await;
            Ok(())
        } else {
            let err = Error::RollbackFailed { failures };
            self.audit(
                EventType::Rollback,
                serde_json::json!({"steps": steps}),
                Some(err.to_string()),
            )
            .await;
            Err(err)
        }
    }

    /// Tears down to accept-all for `family` (or both) and removes all ipsets.
    ///
    /// Leaves the transaction idle.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] after a confirmed or rolled back run, then the
    /// first failing restore.
    pub async fn reset(&mut self, family: Option<Family>) -> Result<()> {
        self.require("reset", &[TransactionState::Idle, TransactionState::Applied])?;

        let families: Vec<Family> = family.map_or_else(|| Family::ALL.to_vec(), |f| vec![f]);
        let result = self.reset_families(&families).await;

        self.state = TransactionState::Idle;
        self.audit(
            EventType::Reset,
            serde_json::json!({"families": families.iter().map(ToString::to_string).collect::<Vec<_>>()}),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;
        result
    }

    async fn reset_families(&self, families: &[Family]) -> Result<()> {
        for &family in families {
            info!(%family, "resetting rules");
            let script = RuleCompiler::reset_script(family)?;
            self.backend.restore_from_text(family, &script).await?;
        }

        info!("resetting ipsets");
        let lines = compile_ipsets(self.config, true)?;
        self.backend
            .restore_ipsets_from_text(&to_script(&lines))
            .await
    }

    /// Applies and persists without waiting for confirmation.
    ///
    /// # Errors
    ///
    /// Anything [`Self::apply`] or [`Self::persist`] returns.
    pub async fn commit(&mut self) -> Result<()> {
        self.apply().await?;
        self.persist().await?;
        self.state = TransactionState::Confirmed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{BackendCall, FakeBackend, ScriptedConfirmation, sample_config};

    fn paths(dir: &tempfile::TempDir) -> RestorePaths {
        RestorePaths::new(dir.path(), None)
    }

    #[test]
    fn test_restore_paths_namespaced() {
        let paths = RestorePaths::new(Path::new("/var/lib/zonewall/rules"), Some("blue"));
        assert_eq!(paths.ip, Path::new("/var/lib/zonewall/rules/blue/iptables.restore"));
        assert_eq!(paths.ip6, Path::new("/var/lib/zonewall/rules/blue/ip6tables.restore"));
        assert_eq!(paths.ipset, Path::new("/var/lib/zonewall/rules/blue/ipsets.restore"));
    }

    #[tokio::test]
    async fn test_apply_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));

        tx.apply().await.unwrap();

        assert_eq!(tx.state(), TransactionState::Applied);
        assert_eq!(
            tx.backend().targets(),
            [Target::Ipsets, Target::Rules(Family::Ip), Target::Rules(Family::Ip6)]
        );
    }

    #[tokio::test]
    async fn test_compile_error_makes_no_backend_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample_config();
        config
            .zones
            .get_mut("lan")
            .unwrap()
            .rules
            .entry(crate::core::model::Table::Filter)
            .or_default()
            .insert("INPUT".into(), vec!["-s ${missing} -j ACCEPT".into()]);
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));

        let err = tx.apply().await.unwrap_err();

        assert!(matches!(err, Error::UndefinedVariable { .. }));
        assert!(tx.backend().calls().is_empty());
        assert_eq!(tx.state(), TransactionState::Idle);
    }

    #[tokio::test]
    async fn test_apply_aborted_lists_applied_targets() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let backend = FakeBackend::failing(&[Target::Rules(Family::Ip6)]);
        let mut tx = Transaction::new(&config, backend, paths(&dir));

        let err = tx.apply().await.unwrap_err();

        match err {
            Error::ApplyAborted { applied, source } => {
                assert_eq!(applied, [Target::Ipsets, Target::Rules(Family::Ip)]);
                assert!(matches!(*source, Error::Backend { target: Target::Rules(Family::Ip6), .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tx.state(), TransactionState::Applied);
    }

    #[tokio::test]
    async fn test_confirmed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));
        let mut prompt = ScriptedConfirmation::new(ConfirmOutcome::Confirmed);

        tx.apply().await.unwrap();
        let outcome = tx.confirm(&mut prompt, Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::Confirmed);
        assert_eq!(prompt.waited, Some(Duration::from_secs(5)));
        assert_eq!(tx.state(), TransactionState::Confirmed);
        assert!(tx.paths().ip.exists());
        assert!(tx.paths().ip6.exists());
        assert!(tx.paths().ipset.exists());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_to_reset_without_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));
        let mut prompt = ScriptedConfirmation::new(ConfirmOutcome::TimedOut);

        tx.apply().await.unwrap();
        let outcome = tx.confirm(&mut prompt, Duration::from_secs(1)).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::TimedOut);
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let calls = tx.backend().calls();
        let rollback = &calls[3..];
        assert_eq!(rollback.len(), 3);
        assert!(
            matches!(&rollback[0], BackendCall::RestoreText(Target::Rules(Family::Ip), text)
                if text.contains(":INPUT ACCEPT") && !text.contains("-A "))
        );
        assert!(matches!(&rollback[1], BackendCall::RestoreText(Target::Rules(Family::Ip6), _)));
        assert_eq!(rollback[2], BackendCall::RestoreText(Target::Ipsets, "flush\ndestroy\n".into()));
        assert!(!tx.paths().ip.exists());
    }

    #[tokio::test]
    async fn test_abort_replays_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let paths = paths(&dir);
        std::fs::write(&paths.ip, "*filter\nCOMMIT\n").unwrap();
        std::fs::write(&paths.ipset, "").unwrap();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths.clone());
        let mut prompt = ScriptedConfirmation::new(ConfirmOutcome::Aborted);

        tx.apply().await.unwrap();
        tx.confirm(&mut prompt, Duration::from_secs(1)).await.unwrap();

        let calls = tx.backend().calls();
        assert_eq!(calls[3], BackendCall::RestoreFile(Target::Rules(Family::Ip), paths.ip.clone()));
        assert!(matches!(&calls[4], BackendCall::RestoreText(Target::Rules(Family::Ip6), _)));
        assert_eq!(calls[5], BackendCall::RestoreFile(Target::Ipsets, paths.ipset.clone()));
    }

    #[tokio::test]
    async fn test_rollback_attempts_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let backend = FakeBackend::failing(&[Target::Rules(Family::Ip), Target::Ipsets]);
        let mut tx = Transaction::new(&config, backend, paths(&dir));

        let err = tx.rollback().await.unwrap_err();

        match err {
            Error::RollbackFailed { failures } => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("ip rules"));
                assert!(failures[1].starts_with("ipsets"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tx.backend().targets().len(), 3);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_saved_state_is_not_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let paths = paths(&dir);
        // Symlink loop: stat fails with ELOOP
        std::os::unix::fs::symlink(&paths.ip, &paths.ip).unwrap();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths);

        let err = tx.rollback().await.unwrap_err();

        match err {
            Error::RollbackFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("ip rules"));
                assert!(failures[0].contains("cannot check saved state"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // ip got neither the saved file nor the accept-all script
        assert_eq!(
            tx.backend().targets(),
            [Target::Rules(Family::Ip6), Target::Ipsets]
        );
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_reset_single_family() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));

        tx.reset(Some(Family::Ip6)).await.unwrap();

        assert_eq!(
            tx.backend().targets(),
            [Target::Rules(Family::Ip6), Target::Ipsets]
        );
        assert_eq!(tx.state(), TransactionState::Idle);
    }

    #[tokio::test]
    async fn test_reset_both_families() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));

        tx.reset(None).await.unwrap();

        assert_eq!(
            tx.backend().targets(),
            [Target::Rules(Family::Ip), Target::Rules(Family::Ip6), Target::Ipsets]
        );
    }

    #[tokio::test]
    async fn test_commit_persists_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));

        tx.commit().await.unwrap();

        assert_eq!(tx.state(), TransactionState::Confirmed);
        assert!(matches!(tx.backend().calls().last(), Some(BackendCall::Save(Target::Rules(Family::Ip6), _))));
    }

    #[tokio::test]
    async fn test_wrong_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let mut tx = Transaction::new(&config, FakeBackend::default(), paths(&dir));
        let mut prompt = ScriptedConfirmation::new(ConfirmOutcome::Confirmed);

        assert!(matches!(
            tx.confirm(&mut prompt, Duration::from_secs(1)).await,
            Err(Error::InvalidState { operation: "confirm", .. })
        ));
        assert!(matches!(tx.persist().await, Err(Error::InvalidState { .. })));

        tx.commit().await.unwrap();
        assert!(matches!(tx.apply().await, Err(Error::InvalidState { .. })));
        let err = tx.rollback().await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot rollback while transaction is confirmed");
    }

    #[tokio::test]
    async fn test_audit_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let audit = AuditLog::at(dir.path().join("audit.log"));
        let mut tx =
            Transaction::new(&config, FakeBackend::default(), paths(&dir)).with_audit(audit.clone());

        tx.commit().await.unwrap();

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Apply);
        assert_eq!(events[0].event_type, EventType::Persist);
        assert!(events.iter().all(|e| e.success && e.run_id == tx.run_id()));
        assert_eq!(events[1].details["ip_sha256"].as_str().map(str::len), Some(64));
    }
}
