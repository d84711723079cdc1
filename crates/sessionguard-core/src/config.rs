//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which holds the
//! service base URL, timeouts, the refresh credential backend and the last
//! used login identifier.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::ClientOptions;
use crate::auth::{FileRefreshStore, KeyringRefreshStore, MemoryRefreshStore, RefreshStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

/// Environment variable overriding `base_url`
pub const ENV_BASE_URL: &str = "SESSIONGUARD_BASE_URL";

/// Environment variable overriding `storage`
pub const ENV_STORAGE: &str = "SESSIONGUARD_STORAGE";

/// Where the refresh credential is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keyring,
    File,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Refresh exchanges taking longer than this count as failed
    pub refresh_timeout_secs: Option<u64>,
    pub max_rate_limit_retries: u32,
    pub storage: StorageBackend,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let options = ClientOptions::new(DEFAULT_BASE_URL);
        Self {
            base_url: options.base_url,
            request_timeout_secs: options.request_timeout.as_secs(),
            refresh_timeout_secs: options.refresh_timeout.map(|d| d.as_secs()),
            max_rate_limit_retries: options.max_rate_limit_retries,
            storage: StorageBackend::default(),
            last_identifier: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `SESSIONGUARD_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(ENV_BASE_URL).ok(),
            std::env::var(ENV_STORAGE).ok(),
        )
    }

    fn apply_overrides(&mut self, base_url: Option<String>, storage: Option<String>) -> Result<()> {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(storage) = storage {
            self.storage = storage
                .parse()
                .with_context(|| format!("Invalid {}", ENV_STORAGE))?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new(self.base_url.clone());
        options.request_timeout = Duration::from_secs(self.request_timeout_secs);
        options.refresh_timeout = self.refresh_timeout_secs.map(Duration::from_secs);
        options.max_rate_limit_retries = self.max_rate_limit_retries;
        options
    }

    /// Build the refresh credential backend selected by `storage`.
    pub fn refresh_store(&self) -> Result<Arc<dyn RefreshStore>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringRefreshStore::new()),
            StorageBackend::File => Arc::new(FileRefreshStore::new(self.cache_dir()?)),
            StorageBackend::Memory => Arc::new(MemoryRefreshStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from(&tmp.path().join("config.json")).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.refresh_timeout_secs, Some(10));
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.base_url = "https://auth.example.com/api".to_string();
        config.storage = StorageBackend::File;
        config.last_identifier = Some("user@example.com".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.base_url, "https://auth.example.com/api");
        assert_eq!(loaded.storage, StorageBackend::File);
        assert_eq!(loaded.last_identifier.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"storage": "memory"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(Some("http://127.0.0.1:9000".into()), Some("FILE".into()))
            .unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.storage, StorageBackend::File);

        config.apply_overrides(Some("  ".into()), None).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");

        assert!(config.apply_overrides(None, Some("floppy".into())).is_err());
    }

    #[test]
    fn test_client_options() {
        let mut config = Config::default();
        config.request_timeout_secs = 5;
        config.refresh_timeout_secs = None;
        config.max_rate_limit_retries = 0;

        let options = config.client_options();
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert!(options.refresh_timeout.is_none());
        assert_eq!(options.max_rate_limit_retries, 0);
    }
}
