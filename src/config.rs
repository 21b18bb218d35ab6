//! Application settings that are not part of the broker connection.
//!
//! Read from `aquadash.toml` in the config directory. Every field has a default
//! and a broken file is logged and ignored, so the dashboard always starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dashboard::alerts::Thresholds;
use crate::mqtt::BackoffPolicy;
use crate::persistence::{SyncPolicy, SyncThrottle};

pub const APP_NAME: &str = "aquadash";
pub const CONFIG_FILE: &str = "aquadash.toml";
pub const READINGS_FILE: &str = "readings.jsonl";
pub const CONFIG_DIR_ENV: &str = "AQUADASH_CONFIG_DIR";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub policy: SyncPolicy,
    pub interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::RateLimited,
            interval_ms: 30_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    /// History window for statistics
    pub window_hours: u64,
    /// How often history is pulled from the repository
    pub refresh_secs: u64,
    /// Readings pushed by the live subscription
    pub recent_count: usize,
    pub thresholds: Thresholds,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            refresh_secs: 60,
            recent_count: 10,
            thresholds: Thresholds::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub backoff: BackoffPolicy,
    pub dashboard: DashboardConfig,
    /// Where readings are stored; platform data dir when unset
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads `aquadash.toml` from `dir`, falling back to defaults.
    pub async fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no app config, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), "could not read app config: {}", e);
                return Self::default();
            }
        };

        match Self::from_toml(&content) {
            Ok(config) => {
                info!(path = %path.display(), "loaded app config");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), "invalid app config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub fn throttle(&self) -> SyncThrottle {
        SyncThrottle::new(self.sync.policy, Duration::from_millis(self.sync.interval_ms))
    }

    pub fn readings_path(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
            .join(READINGS_FILE)
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
[sync]
policy = "unconditional"

[backoff]
max_attempts = 3
"#,
        )
        .unwrap();

        assert_eq!(config.sync.policy, SyncPolicy::Unconditional);
        assert_eq!(config.sync.interval_ms, 30_000);
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.backoff.base_delay_ms, 2_000);
        assert_eq!(config.dashboard, DashboardConfig::default());
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(AppConfig::from_toml("[sync]\npolicy = \"sometimes\"\n").is_err());
    }

    #[tokio::test]
    async fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(CONFIG_FILE), "sync = 5")
            .await
            .unwrap();
        assert_eq!(AppConfig::load(dir.path()).await, AppConfig::default());
    }

    #[tokio::test]
    async fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AppConfig::load(dir.path()).await, AppConfig::default());
    }

    #[test]
    fn data_dir_override() {
        let config = AppConfig {
            data_dir: Some(PathBuf::from("/var/lib/aquadash")),
            ..AppConfig::default()
        };
        assert_eq!(
            config.readings_path(),
            PathBuf::from("/var/lib/aquadash/readings.jsonl")
        );
    }
}
