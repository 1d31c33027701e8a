//! Configuration management.
//!
//! This module resolves the local database path and loads sync settings
//! from `~/.psync/config.json`.
//!
//! # Architecture
//!
//! psync keeps one **global database** per user at
//! `~/.psync/data/psync.db`, holding every workspace's entities, files and
//! sync bookkeeping. The remote branch, retry behaviour and worker counts
//! live in the config file, with environment overrides for secrets and
//! per-invocation tweaks.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Git hosting endpoint and branch that a workspace syncs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Never written back to disk by `save_settings`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            owner: String::new(),
            repo: String::new(),
            branch: "main".to_string(),
            token: None,
        }
    }
}

impl RemoteSettings {
    /// Check that a remote has been configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if owner, repo or branch is empty.
    pub fn require(&self) -> Result<&Self> {
        if self.owner.trim().is_empty() || self.repo.trim().is_empty() {
            return Err(Error::Config(
                "remote.owner and remote.repo must be set".to_string(),
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(Error::Config("remote.branch must not be empty".to_string()));
        }
        Ok(self)
    }
}

/// Sync settings from `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Lock scope for sync runs.
    pub workspace: String,
    pub remote: RemoteSettings,
    /// Per-request timeout for remote calls.
    pub timeout_secs: u64,
    /// Retries after the first attempt for transient remote failures.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Age after which a held sync lock counts as abandoned.
    pub lock_ttl_secs: u64,
    /// Worker threads for hashing entities during preview.
    pub hash_workers: usize,
    /// Default for adopting same-named local entities on pull.
    pub allow_name_matching: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            remote: RemoteSettings::default(),
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
            lock_ttl_secs: 600,
            hash_workers: std::thread::available_parallelism().map_or(4, |n| n.get().min(8)),
            allow_name_matching: false,
        }
    }
}

impl SyncSettings {
    /// Apply environment overrides, looked up through `var`.
    ///
    /// Priority for the token: `PSYNC_REMOTE_TOKEN` > `GITHUB_TOKEN` > file.
    #[must_use]
    pub fn with_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty("PSYNC_REMOTE_TOKEN").or_else(|| non_empty("GITHUB_TOKEN")) {
            self.remote.token = Some(token);
        }
        if let Some(branch) = non_empty("PSYNC_BRANCH") {
            self.remote.branch = branch;
        }
        if let Some(workspace) = non_empty("PSYNC_WORKSPACE") {
            self.workspace = workspace;
        }
        self
    }
}

/// Get the global psync directory location (`~/.psync/`).
#[must_use]
pub fn global_psync_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".psync"))
}

/// Get the config file path.
fn config_path() -> Result<PathBuf> {
    global_psync_dir()
        .map(|dir| dir.join("config.json"))
        .ok_or(Error::Config("Could not determine home directory".into()))
}

/// Load settings from `~/.psync/config.json` with environment overrides.
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub fn load_settings() -> Result<SyncSettings> {
    let settings = load_settings_from(&config_path()?)?;
    Ok(settings.with_overrides(|key| std::env::var(key).ok()))
}

/// Load settings from a specific file, without environment overrides.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub fn load_settings_from(path: &Path) -> Result<SyncSettings> {
    if !path.exists() {
        return Ok(SyncSettings::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {e}")))
}

/// Save settings to `~/.psync/config.json`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be written.
pub fn save_settings(settings: &SyncSettings) -> Result<()> {
    save_settings_to(&config_path()?, settings)
}

/// Save settings to a specific file. The token is never persisted.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file cannot be written.
pub fn save_settings_to(path: &Path, settings: &SyncSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
    }

    let mut on_disk = settings.clone();
    on_disk.remote.token = None;

    let content = serde_json::to_string_pretty(&on_disk)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    fs::write(path, content).map_err(|e| Error::Config(format!("Failed to write config file: {e}")))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `PSYNC_DB` environment variable
/// 3. Global location: `~/.psync/data/psync.db`
///
/// # Returns
///
/// Returns the path to the database file, or `None` if no location found.
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(db_path) = std::env::var("PSYNC_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_psync_dir().map(|dir| dir.join("data").join("psync.db"))
}

/// Get the default actor name recorded in audit events.
///
/// Priority:
/// 1. `PSYNC_ACTOR` environment variable
/// 2. Git user name
/// 3. System username
/// 4. "unknown"
#[must_use]
pub fn default_actor() -> String {
    if let Ok(actor) = std::env::var("PSYNC_ACTOR") {
        if !actor.is_empty() {
            return actor;
        }
    }

    if let Ok(output) = std::process::Command::new("git")
        .args(["config", "user.name"])
        .output()
    {
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    if let Ok(user) = std::env::var("USER") {
        return user;
    }

    "unknown".to_string()
}
