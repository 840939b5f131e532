//! Monitor configuration management.
//!
//! Configuration is stored as TOML in `sessionlink/monitor.toml` under
//! `$XDG_CONFIG_HOME` (falling back to `%APPDATA%` or `~/.config`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sessionlink_connection::{ConnectionConfig, RetryConfig};
use sessionlink_protocol::constants::{
    CONNECT_TIMEOUT, MAX_RETRY_PERIOD, MIN_RETRY_PERIOD, PING_TIMEOUT, RETRY_BACKOFF_FACTOR,
};

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Candidate base URIs, tried in order.
    #[serde(default = "default_base_uris")]
    pub base_uris: Vec<String>,

    /// Session to resume on the first connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default = "default_min_retry_ms")]
    pub min_retry_ms: u64,

    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

fn default_base_uris() -> Vec<String> {
    vec!["http://localhost:8501".into()]
}

fn default_min_retry_ms() -> u64 {
    MIN_RETRY_PERIOD.as_millis() as u64
}

fn default_max_retry_ms() -> u64 {
    MAX_RETRY_PERIOD.as_millis() as u64
}

fn default_backoff_factor() -> f64 {
    RETRY_BACKOFF_FACTOR
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT.as_millis() as u64
}

fn default_ping_timeout_ms() -> u64 {
    PING_TIMEOUT.as_millis() as u64
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_uris: default_base_uris(),
            session_id: None,
            min_retry_ms: default_min_retry_ms(),
            max_retry_ms: default_max_retry_ms(),
            backoff_factor: default_backoff_factor(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

impl MonitorConfig {
    /// Loads configuration from the default location, creating it if missing.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Loads configuration from `path`, or writes a default there if not found.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: MonitorConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = MonitorConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May contain a session id.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Builds the connection manager configuration.
    pub fn connection_config(&self) -> anyhow::Result<ConnectionConfig> {
        let mut config = ConnectionConfig::new(&self.base_uris)?;
        config.retry = RetryConfig {
            min_delay: Duration::from_millis(self.min_retry_ms),
            max_delay: Duration::from_millis(self.max_retry_ms),
            backoff_factor: self.backoff_factor,
        };
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.ping_timeout = Duration::from_millis(self.ping_timeout_ms);
        config.session_id = self.session_id.clone();
        config.validate()?;
        Ok(config)
    }
}

/// Returns the path of `sessionlink/monitor.toml` under the user's
/// configuration directory.
pub fn config_path() -> anyhow::Result<PathBuf> {
    let dir = config_dir(|name| std::env::var_os(name)).ok_or_else(|| {
        anyhow::anyhow!("no configuration directory: set XDG_CONFIG_HOME or HOME")
    })?;
    Ok(dir.join("sessionlink").join("monitor.toml"))
}

/// `$XDG_CONFIG_HOME`, then `%APPDATA%`, then `$HOME/.config`. Empty
/// values count as unset.
fn config_dir(var: impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let non_empty = |name: &str| var(name).filter(|v| !v.is_empty()).map(PathBuf::from);
    non_empty("XDG_CONFIG_HOME")
        .or_else(|| non_empty("APPDATA"))
        .or_else(|| non_empty("HOME").map(|home| home.join(".config")))
}
