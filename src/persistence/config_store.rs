//! # Configuration Store
//!
//! Persists the broker [`ConnectionConfig`] under a single key of a local
//! key-value store. The value is the JSON form of the config, the store file
//! itself is a flat TOML table of string values.
//!
//! ## Failure Policy
//!
//! Loading is fail-safe: a missing key, unreadable file, unparsable JSON or a
//! config that fails validation all resolve to [`ConnectionConfig::default`].
//! Writes are explicit user actions, so their failures are returned.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::mqtt::ConnectionConfig;

pub const CONNECTION_CONFIG_KEY: &str = "connection_config";
pub const STORE_FILE: &str = "store.toml";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;

    fn set(&self, key: &str, value: String)
        -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Key-value store kept as a TOML table in one file.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileKvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store file inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(BTreeMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        match toml::from_str(&content) {
            Ok(table) => Ok(table),
            Err(e) => {
                warn!(path = %self.path.display(), "store file unreadable, starting empty: {}", e);
                Ok(BTreeMap::new())
            }
        }
    }
}

impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_table().await?.remove(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut table = self.read_table().await?;
        table.insert(key.to_string(), value);
        let content = toml::to_string_pretty(&table)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write beside the target and rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(key, path = %self.path.display(), "stored value");
        Ok(())
    }
}

/// Volatile store, handy for tests and for running without a config directory.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: Mutex<HashMap<String, String>>,
    read_only: bool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose writes always fail.
    pub fn read_only() -> Self {
        Self {
            values: Mutex::default(),
            read_only: true,
        }
    }

    pub fn with_value(key: &str, value: impl Into<String>) -> Self {
        let store = Self::new();
        store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.into());
        store
    }
}

impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::Rejected(format!("{key} is read-only")));
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigStore<S> {
    store: S,
}

impl<S: KeyValueStore> ConfigStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Stored config, or the default if there is none or it cannot be used.
    pub async fn load(&self) -> ConnectionConfig {
        let raw = match self.store.get(CONNECTION_CONFIG_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("no stored connection config, using defaults");
                return ConnectionConfig::default();
            }
            Err(e) => {
                warn!("could not read connection config, using defaults: {}", e);
                return ConnectionConfig::default();
            }
        };

        match serde_json::from_str::<ConnectionConfig>(&raw) {
            Ok(config) => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    warn!("stored connection config invalid ({}), using defaults", e);
                    ConnectionConfig::default()
                }
            },
            Err(e) => {
                warn!("stored connection config unparsable ({}), using defaults", e);
                ConnectionConfig::default()
            }
        }
    }

    pub async fn save(&self, config: &ConnectionConfig) -> Result<(), StorageError> {
        let raw = serde_json::to_string(config)?;
        self.store.set(CONNECTION_CONFIG_KEY, raw).await?;
        info!(broker = %config, "connection config saved");
        Ok(())
    }

    pub async fn reset(&self) -> Result<ConnectionConfig, StorageError> {
        let defaults = ConnectionConfig::default();
        self.save(&defaults).await?;
        Ok(defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_default() -> ConnectionConfig {
        ConnectionConfig {
            host: "broker.hivemq.com".into(),
            port: 8000,
            topic: "semester_project/water_quality".into(),
            path: "/mqtt".into(),
            use_ssl: false,
        }
    }

    #[tokio::test]
    async fn empty_store_loads_defaults() {
        let store = ConfigStore::new(MemoryKvStore::new());
        assert_eq!(store.load().await, expected_default());
    }

    #[tokio::test]
    async fn corrupt_value_loads_defaults() {
        let store = ConfigStore::new(MemoryKvStore::with_value(CONNECTION_CONFIG_KEY, "{not json"));
        assert_eq!(store.load().await, expected_default());

        let blank_host = r#"{"host":"","port":1883,"topic":"t","useSSL":false}"#;
        let store = ConfigStore::new(MemoryKvStore::with_value(CONNECTION_CONFIG_KEY, blank_host));
        assert_eq!(store.load().await, expected_default());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = ConfigStore::new(MemoryKvStore::new());
        let config = ConnectionConfig {
            host: "test.mosquitto.org".into(),
            port: 8081,
            topic: "lab/tank1".into(),
            path: "/".into(),
            use_ssl: true,
        };
        store.save(&config).await.unwrap();
        assert_eq!(store.load().await, config);
    }

    #[tokio::test]
    async fn write_failures_are_reported() {
        let store = ConfigStore::new(MemoryKvStore::read_only());
        assert!(matches!(
            store.save(&ConnectionConfig::default()).await,
            Err(StorageError::Rejected(_))
        ));
        assert!(store.reset().await.is_err());
        // Loading still works and yields defaults.
        assert_eq!(store.load().await, expected_default());
    }

    #[tokio::test]
    async fn reset_persists_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(FileKvStore::in_dir(dir.path()));
        let custom = ConnectionConfig {
            host: "example.org".into(),
            ..ConnectionConfig::default()
        };
        store.save(&custom).await.unwrap();
        assert_eq!(store.load().await.host, "example.org");

        assert_eq!(store.reset().await.unwrap(), expected_default());
        let reopened = ConfigStore::new(FileKvStore::in_dir(dir.path()));
        assert_eq!(reopened.load().await, expected_default());
    }

    #[tokio::test]
    async fn garbage_store_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(STORE_FILE), "[[[ nope")
            .await
            .unwrap();
        let store = ConfigStore::new(FileKvStore::in_dir(dir.path()));
        assert_eq!(store.load().await, expected_default());

        // A save replaces the broken file.
        store.save(&ConnectionConfig::default()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join(STORE_FILE))
            .await
            .unwrap();
        assert!(content.contains(CONNECTION_CONFIG_KEY));
    }
}
