//! Ruleset backend: the seam between zonewall and the kernel
//!
//! [`RulesetBackend`] is everything the transaction logic needs from the
//! packet filter: restore a script, restore a saved file, save live state.
//! [`CommandBackend`] implements it by spawning `iptables-restore`,
//! `ip6tables-restore`, `iptables-save`, `ip6tables-save` and `ipset`.
//!
//! Restores are atomic per invocation on the tool side: a script that fails
//! to parse leaves the previous tables in place. That is the only atomicity
//! zonewall relies on.

use crate::core::error::{Error, Result, Target};
use crate::core::ipsets::flush_saved_sets;
use crate::core::model::Family;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::process::{Output, Stdio};
use tracing::{debug, error, info};

/// Kernel-facing operations used by the transaction manager
#[allow(async_fn_in_trait)]
pub trait RulesetBackend {
    /// Replaces the rule tables of `family` with `text`
    async fn restore_from_text(&self, family: Family, text: &str) -> Result<()>;

    /// Replaces the rule tables of `family` with a previously saved file
    async fn restore_from_file(&self, family: Family, path: &Path) -> Result<()>;

    /// Writes the live rule tables of `family` to `path`
    async fn save_to_file(&self, family: Family, path: &Path) -> Result<()>;

    /// Feeds `text` to `ipset restore`
    async fn restore_ipsets_from_text(&self, text: &str) -> Result<()>;

    /// Feeds a previously saved file to `ipset restore`
    async fn restore_ipsets_from_file(&self, path: &Path) -> Result<()>;

    /// Writes the live ipsets to `path`
    async fn save_ipsets_to_file(&self, path: &Path) -> Result<()>;
}

fn default_iptables_restore() -> Vec<String> {
    vec!["iptables-restore".to_string()]
}

fn default_ip6tables_restore() -> Vec<String> {
    vec!["ip6tables-restore".to_string()]
}

fn default_iptables_save() -> Vec<String> {
    vec!["iptables-save".to_string()]
}

fn default_ip6tables_save() -> Vec<String> {
    vec!["ip6tables-save".to_string()]
}

fn default_ipset() -> Vec<String> {
    vec!["ipset".to_string()]
}

/// Command lines (program followed by leading arguments) for each tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCommands {
    #[serde(default = "default_iptables_restore")]
    pub iptables_restore: Vec<String>,
    #[serde(default = "default_ip6tables_restore")]
    pub ip6tables_restore: Vec<String>,
    #[serde(default = "default_iptables_save")]
    pub iptables_save: Vec<String>,
    #[serde(default = "default_ip6tables_save")]
    pub ip6tables_save: Vec<String>,
    #[serde(default = "default_ipset")]
    pub ipset: Vec<String>,
}

impl Default for BackendCommands {
    fn default() -> Self {
        Self {
            iptables_restore: default_iptables_restore(),
            ip6tables_restore: default_ip6tables_restore(),
            iptables_save: default_iptables_save(),
            ip6tables_save: default_ip6tables_save(),
            ipset: default_ipset(),
        }
    }
}

impl BackendCommands {
    pub fn restore(&self, family: Family) -> &[String] {
        match family {
            Family::Ip => &self.iptables_restore,
            Family::Ip6 => &self.ip6tables_restore,
        }
    }

    pub fn save(&self, family: Family) -> &[String] {
        match family {
            Family::Ip => &self.iptables_save,
            Family::Ip6 => &self.ip6tables_save,
        }
    }
}

/// Backend that spawns the packet-filter tools
#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    commands: BackendCommands,
    netns: Option<String>,
}

impl CommandBackend {
    pub fn new(commands: BackendCommands) -> Self {
        Self {
            commands,
            netns: None,
        }
    }

    /// Runs every command inside network namespace `netns`
    pub fn with_netns(mut self, netns: Option<String>) -> Self {
        self.netns = netns;
        self
    }

    pub fn commands(&self) -> &BackendCommands {
        &self.commands
    }

    /// Spawns `argv` plus `extra`, writes `input` to stdin and collects the output.
    ///
    /// A non-zero exit status is NOT an error here; see [`Self::run`].
    pub(crate) async fn spawn_with_input(
        &self,
        target: Target,
        argv: &[String],
        extra: &[&str],
        input: Option<&str>,
    ) -> Result<Output> {
        let mut command =
            crate::elevation::create_elevated_command(argv, extra, self.netns.as_deref())?;

        command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(%target, ?argv, ?extra, netns = ?self.netns, "spawning backend command");

        let mut child = command.spawn().map_err(|e| {
            error!(%target, "Failed to spawn {}: {e}", argv.join(" "));
            Error::Backend {
                target,
                message: format!("failed to spawn {}: {e}", argv.join(" ")),
                stderr: Some(e.to_string()),
                exit_code: None,
            }
        })?;

        let mut write_error = None;
        if let Some(text) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            use tokio::io::AsyncWriteExt;
            let written = match stdin.write_all(text.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                // The tool stopped reading, usually at a bad line; its status and stderr say why
                debug!(%target, "writing to {} stopped: {e}", argv.join(" "));
                write_error = Some(e);
            }
            // stdin is dropped here so the tool sees EOF
        }

        let output = child.wait_with_output().await?;
        match write_error {
            // Exited cleanly without reading all of its input
            Some(e) if output.status.success() => {
                error!(%target, "Failed to write input to {}: {e}", argv.join(" "));
                Err(e.into())
            }
            _ => Ok(output),
        }
    }

    /// Like [`Self::spawn_with_input`] but fails on a non-zero exit status
    async fn run(
        &self,
        target: Target,
        argv: &[String],
        extra: &[&str],
        input: Option<&str>,
    ) -> Result<Vec<u8>> {
        let output = self.spawn_with_input(target, argv, extra, input).await?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(%target, "{} failed: {stderr}", argv.join(" "));
            Err(Error::Backend {
                target,
                message: if stderr.is_empty() {
                    format!("{} exited with {}", argv.join(" "), output.status)
                } else {
                    stderr.clone()
                },
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

/// Writes `contents` next to `path` and renames it into place (mode 0600).
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;
    crate::utils::ensure_dir(dir)?;

    // NamedTempFile is created 0600 on unix
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;

    Ok(())
}

impl RulesetBackend for CommandBackend {
    async fn restore_from_text(&self, family: Family, text: &str) -> Result<()> {
        let target = Target::Rules(family);
        self.run(target, self.commands.restore(family), &[], Some(text))
            .await?;
        info!(%target, lines = text.lines().count(), "restore successful");
        Ok(())
    }

    async fn restore_from_file(&self, family: Family, path: &Path) -> Result<()> {
        info!(%family, "restoring from {}", path.display());
        let text = tokio::fs::read_to_string(path).await?;
        self.restore_from_text(family, &text).await
    }

    async fn save_to_file(&self, family: Family, path: &Path) -> Result<()> {
        let stdout = self
            .run(Target::Rules(family), self.commands.save(family), &[], None)
            .await?;
        write_atomically(path, &stdout)?;
        info!(%family, "saved live rules to {}", path.display());
        Ok(())
    }

    async fn restore_ipsets_from_text(&self, text: &str) -> Result<()> {
        self.run(
            Target::Ipsets,
            &self.commands.ipset,
            &["-exist", "restore"],
            Some(text),
        )
        .await?;
        info!(lines = text.lines().count(), "ipset restore successful");
        Ok(())
    }

    /// Replays a saved file so every saved set ends up with exactly its saved members
    async fn restore_ipsets_from_file(&self, path: &Path) -> Result<()> {
        info!("restoring ipsets from {}", path.display());
        let text = tokio::fs::read_to_string(path).await?;
        self.restore_ipsets_from_text(&flush_saved_sets(&text))
            .await
    }

    async fn save_ipsets_to_file(&self, path: &Path) -> Result<()> {
        let stdout = self
            .run(Target::Ipsets, &self.commands.ipset, &["save"], None)
            .await?;
        write_atomically(path, &stdout)?;
        info!("saved live ipsets to {}", path.display());
        Ok(())
    }
}
