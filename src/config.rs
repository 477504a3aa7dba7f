//! Configuration document loading
//!
//! The firewall document is YAML. An optional defaults document is merged
//! underneath it first: mappings merge key by key, anything else in the user
//! document replaces the default outright. The `settings` section configures
//! the tool itself and is split off before the rest is handed to the compiler.

use crate::core::backend::BackendCommands;
use crate::core::error::{Error, Result};
use crate::core::model::Config;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zonewall/config.yml";
pub const DEFAULT_DEFAULTS_PATH: &str = "/etc/zonewall/defaults.yml";
pub const DEFAULT_RESTORE_DIR: &str = "/var/lib/zonewall/rules";

const SETTINGS_KEY: &str = "settings";

/// Bounds for the confirmation countdown
pub const MIN_CONFIRM_TIMEOUT_SECS: u64 = 1;
pub const MAX_CONFIRM_TIMEOUT_SECS: u64 = 3600;

/// Tool settings from the `settings` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Where persisted restore files live.
    ///
    /// zonewall reads and writes these files itself; only the tools are
    /// elevated. When not running as root this must be a directory the
    /// invoking user can access.
    #[serde(default = "default_restore_dir")]
    pub restore_dir: PathBuf,
    /// Seconds to wait for the operator before rolling back
    ///
    /// Clamped to 1..=3600 by [`Settings::confirm_timeout`].
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
    /// Network namespace to operate in
    #[serde(default)]
    pub netns: Option<String>,
    #[serde(default)]
    pub commands: BackendCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            restore_dir: default_restore_dir(),
            confirm_timeout_secs: default_confirm_timeout(),
            netns: None,
            commands: BackendCommands::default(),
        }
    }
}

fn default_restore_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RESTORE_DIR)
}

fn default_confirm_timeout() -> u64 {
    30
}

impl Settings {
    /// Confirmation timeout clamped to the supported range
    pub fn confirm_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.confirm_timeout_secs
                .clamp(MIN_CONFIRM_TIMEOUT_SECS, MAX_CONFIRM_TIMEOUT_SECS),
        )
    }
}

/// A parsed document: firewall configuration plus tool settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub config: Config,
    pub settings: Settings,
}

/// Merges `overlay` onto `base` in place.
///
/// Mappings merge recursively. Scalars, sequences and nulls in `overlay`
/// replace whatever `base` held.
pub fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Builds a [`Document`] from an already merged YAML value.
///
/// # Errors
///
/// Returns [`Error::Config`] if the top level is not a mapping and
/// [`Error::Yaml`] if a section has the wrong shape.
pub fn parse_document(value: Value) -> Result<Document> {
    let mut map = match value {
        Value::Mapping(map) => map,
        // An empty file parses as null
        Value::Null => serde_yaml::Mapping::new(),
        other => {
            return Err(Error::Config(format!(
                "top level must be a mapping, found {}",
                kind(&other)
            )));
        }
    };

    let settings = match map.remove(SETTINGS_KEY) {
        Some(Value::Null) | None => Settings::default(),
        Some(value) => serde_yaml::from_value(value)?,
    };
    let config: Config = serde_yaml::from_value(Value::Mapping(map))?;

    Ok(Document { config, settings })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

async fn read_yaml(path: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Loads the user document at `path`, merged over `defaults` when given.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
///
/// # Errors
///
/// Fails if either file cannot be read or parsed.
pub async fn load_document(path: &Path, defaults: Option<&Path>) -> Result<Document> {
    let user = read_yaml(path).await?;

    let merged = match defaults {
        Some(defaults_path) => {
            debug!("merging defaults from {}", defaults_path.display());
            let mut base = read_yaml(defaults_path).await?;
            merge_yaml(&mut base, user);
            base
        }
        None => user,
    };

    let document = parse_document(merged)?;
    info!(
        zones = document.config.zones.len(),
        ipsets = document.config.ipsets.len(),
        "loaded configuration from {}",
        path.display()
    );
    Ok(document)
}

/// Defaults document to use: the explicit one, else the system one if it exists
pub async fn resolve_defaults_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    let system = PathBuf::from(DEFAULT_DEFAULTS_PATH);
    match tokio::fs::try_exists(&system).await {
        Ok(true) => Some(system),
        _ => None,
    }
}
