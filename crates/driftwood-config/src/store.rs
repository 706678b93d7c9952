//! Configuration store collaborator and its JSON file implementation.
//!
//! # Design
//! - The store is the only writer of the persisted document; reload re-reads it.
//! - A missing file is not an error: it yields defaults until the first `set`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::model::Settings;
use crate::validate::apply_option;

/// Environment variable selecting the settings file.
pub const CONFIG_PATH_ENV: &str = "DRIFTWOOD_CONFIG";
/// Settings file used when [`CONFIG_PATH_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "driftwood.json";

#[async_trait]
/// Persisted configuration backing the daemon.
pub trait ConfigStore: Send + Sync {
    /// Read the full settings document.
    async fn load(&self) -> ConfigResult<Settings>;
    /// Read one option.
    async fn get(&self, key: &str) -> ConfigResult<Value>;
    /// Validate and persist one option.
    async fn set(&self, key: &str, value: Value) -> ConfigResult<()>;
}

/// Settings persisted as a JSON document on disk.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the path named by `DRIFTWOOD_CONFIG`, or the default path.
    #[must_use]
    pub fn from_env() -> Self {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        Self::new(path)
    }

    /// Location of the settings document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, settings: &Settings) -> ConfigResult<()> {
        let encoded =
            serde_json::to_vec_pretty(settings).map_err(|source| ConfigError::Json {
                operation: "config.store.encode",
                source,
            })?;
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    operation: "config.store.create_dir",
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, encoded)
            .await
            .map_err(|source| ConfigError::Io {
                operation: "config.store.write",
                path: staging.clone(),
                source,
            })?;
        fs::rename(&staging, &self.path)
            .await
            .map_err(|source| ConfigError::Io {
                operation: "config.store.rename",
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self) -> ConfigResult<Settings> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "settings file missing; using defaults");
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    operation: "config.store.read",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let settings: Settings =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Json {
                operation: "config.store.decode",
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    async fn get(&self, key: &str) -> ConfigResult<Value> {
        self.load().await?.get(key)
    }

    async fn set(&self, key: &str, value: Value) -> ConfigResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.load().await?;
        apply_option(&mut settings, key, &value)?;
        self.write(&settings).await?;
        debug!(key, "settings option persisted");
        Ok(())
    }
}
