// Daemon configuration file: `~/.gitsync/config.toml`.
//
// The file may hold a remote URL with credentials, so it is written with
// owner-only permissions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gitsync_common::types::{CheckoutConfig, InvalidCheckoutConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::RepoOptions;

/// Root directory for gitsync state: `~/.gitsync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".gitsync"))
}

/// Path to the config file: `~/.gitsync/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Remote to mirror. Required to run.
    pub remote_url: Option<String>,
    /// Base directory for the mirror and working checkouts. Defaults to
    /// `~/.gitsync/cache`.
    pub cache_dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
    /// Per-command timeout; 0 disables it.
    pub command_timeout_secs: u64,
    pub retry_interval_secs: u64,
    /// GnuPG home for reading commit signatures.
    pub gpg_home: Option<PathBuf>,
    /// Working checkout settings for consumers of the mirror.
    pub checkout: Option<CheckoutConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            cache_dir: None,
            poll_interval_secs: 300,
            command_timeout_secs: 20,
            retry_interval_secs: 10,
            gpg_home: None,
            checkout: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `~/.gitsync/config.toml`; defaults when the file is absent.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`, returning defaults if it does not exist. A file
    /// that exists but does not parse is an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_from(path) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            restrict_mode(parent, 0o700)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        restrict_mode(path, 0o600)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.remote_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(ConfigError::Missing("remote_url")),
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be positive".into()));
        }
        if let Some(checkout) = &self.checkout {
            checkout.validate()?;
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.clone().or_else(|| global_dir().map(|d| d.join("cache")))
    }

    /// Repository options derived from this file.
    pub fn repo_options(&self) -> Result<RepoOptions, ConfigError> {
        let base = self.cache_dir().ok_or(ConfigError::Missing("cache_dir"))?;
        let mut options = RepoOptions::new(base);
        options.poll_interval = Duration::from_secs(self.poll_interval_secs);
        options.retry_interval = Duration::from_secs(self.retry_interval_secs);
        let timeout = Duration::from_secs(self.command_timeout_secs);
        options.command_timeout = Some(timeout).filter(|timeout| !timeout.is_zero());
        options.gpg_home = self.gpg_home.clone();
        Ok(options)
    }
}

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let current = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if current != mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> Result<(), ConfigError> {
    Ok(())
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config is missing `{0}`")]
    Missing(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid checkout config: {0}")]
    Checkout(#[from] InvalidCheckoutConfig),
}
