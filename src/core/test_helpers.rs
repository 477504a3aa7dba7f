//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::backend::RulesetBackend;
use crate::core::error::{Error, Result, Target};
use crate::core::model::{Config, Family};
use crate::core::transaction::{Confirmation, ConfirmOutcome};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("ZONEWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("ZONEWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// One recorded backend invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    RestoreText(Target, String),
    RestoreFile(Target, PathBuf),
    Save(Target, PathBuf),
}

impl BackendCall {
    pub fn target(&self) -> Target {
        match self {
            BackendCall::RestoreText(target, _)
            | BackendCall::RestoreFile(target, _)
            | BackendCall::Save(target, _) => *target,
        }
    }
}

/// In-memory backend that records every call.
///
/// Calls on a target listed in `failing` are recorded and then fail with
/// [`Error::Backend`]. Saves write a marker line to the requested path so
/// tests can check what was persisted.
#[derive(Debug, Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    failing: Vec<Target>,
}

impl FakeBackend {
    pub fn failing(targets: &[Target]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: targets.to_vec(),
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Target of each call, in call order
    pub fn targets(&self) -> Vec<Target> {
        self.calls().iter().map(BackendCall::target).collect()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        let target = call.target();
        self.calls.lock().unwrap().push(call);
        if self.failing.contains(&target) {
            Err(Error::Backend {
                target,
                message: "simulated failure".to_string(),
                stderr: Some("simulated failure".to_string()),
                exit_code: Some(1),
            })
        } else {
            Ok(())
        }
    }

    fn write_marker(target: Target, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, format!("# saved {target}\n"))?;
        Ok(())
    }
}

impl RulesetBackend for FakeBackend {
    async fn restore_from_text(&self, family: Family, text: &str) -> Result<()> {
        self.record(BackendCall::RestoreText(Target::Rules(family), text.to_string()))
    }

    async fn restore_from_file(&self, family: Family, path: &Path) -> Result<()> {
        self.record(BackendCall::RestoreFile(Target::Rules(family), path.to_path_buf()))
    }

    async fn save_to_file(&self, family: Family, path: &Path) -> Result<()> {
        self.record(BackendCall::Save(Target::Rules(family), path.to_path_buf()))?;
        Self::write_marker(Target::Rules(family), path)
    }

    async fn restore_ipsets_from_text(&self, text: &str) -> Result<()> {
        self.record(BackendCall::RestoreText(Target::Ipsets, text.to_string()))
    }

    async fn restore_ipsets_from_file(&self, path: &Path) -> Result<()> {
        self.record(BackendCall::RestoreFile(Target::Ipsets, path.to_path_buf()))
    }

    async fn save_ipsets_to_file(&self, path: &Path) -> Result<()> {
        self.record(BackendCall::Save(Target::Ipsets, path.to_path_buf()))?;
        Self::write_marker(Target::Ipsets, path)
    }
}

/// Confirmation that answers immediately with a fixed outcome
#[derive(Debug)]
pub struct ScriptedConfirmation {
    pub outcome: ConfirmOutcome,
    /// Timeout passed to the last `wait`
    pub waited: Option<Duration>,
}

impl ScriptedConfirmation {
    pub fn new(outcome: ConfirmOutcome) -> Self {
        Self {
            outcome,
            waited: None,
        }
    }
}

impl Confirmation for ScriptedConfirmation {
    async fn wait(&mut self, timeout: Duration) -> ConfirmOutcome {
        self.waited = Some(timeout);
        self.outcome
    }
}

/// Parses a YAML configuration document
pub fn config_from_yaml(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}

/// A small but complete configuration touching every section.
pub fn sample_config() -> Config {
    config_from_yaml(
        r"
global:
  policy:
    filter:
      INPUT: DROP
      FORWARD: DROP
  rules:
    pre_default:
      filter:
        INPUT:
          - -m conntrack --ctstate INVALID -j DROP
    default:
      filter:
        INPUT:
          - -i lo -j ACCEPT
          - -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT
  helper_chains:
    filter:
      LOG_REJECT:
        - -j LOG --log-prefix reject
        - -j REJECT
zones:
  lan:
    interfaces: [eth0, eth1]
    rules:
      filter:
        INPUT:
          - -p tcp --dport 22 -s ${admin_net} -j ACCEPT
        FORWARD:
          - -o %{wan} -j ACCEPT
  wan:
    interfaces: [ppp0]
    rules:
      nat:
        POSTROUTING:
          - -j MASQUERADE
ipsets:
  trusted:
    type: hash:net
    entries:
      - ${admin_net}
variables:
  admin_net: 10.0.0.0/24
",
    )
}
