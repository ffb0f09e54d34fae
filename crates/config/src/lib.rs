use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::UiLanguage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const APP_DIR_NAME: &str = "murmur";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Relative paths resolve against the data directory.
    pub database_file: PathBuf,
    pub page_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: PathBuf::from("murmur.db"),
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub namespace: String,
    #[serde(default)]
    pub local_encryption_enabled: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            namespace: "murmur".to_string(),
            local_encryption_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub request_timeout_secs: u64,
    pub resource_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            resource_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub openai: TimeoutConfig,
    #[serde(default)]
    pub ollama: TimeoutConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default)]
    pub models_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub schema_version: u32,
    pub language: UiLanguage,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            language: UiLanguage::EnUs,
            storage: StorageConfig::default(),
            secrets: SecretsConfig::default(),
            adapters: AdaptersConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        if self.storage.database_file.is_absolute() {
            self.storage.database_file.clone()
        } else {
            data_dir.join(&self.storage.database_file)
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push(APP_DIR_NAME);
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            info!(path = %self.path.display(), "wrote default config");
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        if self.migrate(&mut config) {
            self.save(&config)?;
        }
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) -> bool {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return false;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        // A zero page size would make every listing empty.
        if config.storage.page_size == 0 {
            config.storage.page_size = StorageConfig::default().page_size;
        }
        if config.secrets.namespace.trim().is_empty() {
            config.secrets.namespace = SecretsConfig::default().namespace;
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
        true
    }
}

/// Directory for the database and secret files.
pub fn default_data_dir() -> Result<PathBuf> {
    let mut dir = dirs::data_dir().context("failed to resolve data_dir")?;
    dir.push(APP_DIR_NAME);
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn creates_default_config_when_missing() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let config = store.load_or_init().expect("load default");
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.adapters.openai.request_timeout_secs, 60);
        assert_eq!(config.adapters.ollama.resource_timeout_secs, 300);
        assert_eq!(config.storage.page_size, 50);
        assert!(!config.ollama.models_enabled);
        assert!(store.path().exists());
    }

    #[test]
    fn migrates_older_schema_and_fills_missing_sections() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        fs::write(
            store.path(),
            r#"{"schema_version":1,"language":"zh_cn","secrets":{"namespace":" "}}"#,
        )
        .expect("write");

        let config = store.load_or_init().expect("load");
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.language, UiLanguage::ZhCn);
        assert_eq!(config.secrets.namespace, "murmur");
        assert_eq!(config.adapters, AdaptersConfig::default());

        let reread: AppConfig =
            serde_json::from_str(&fs::read_to_string(store.path()).expect("read")).expect("json");
        assert_eq!(reread, config);
    }

    #[test]
    fn keeps_custom_timeouts() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        let mut config = AppConfig::default();
        config.adapters.ollama = TimeoutConfig {
            request_timeout_secs: 5,
            resource_timeout_secs: 900,
        };
        store.save(&config).expect("save");
        assert_eq!(store.load_or_init().expect("load"), config);
    }

    #[test]
    fn resolves_relative_database_path_against_data_dir() {
        let config = AppConfig::default();
        let data_dir = Path::new("/var/lib/murmur");
        assert_eq!(
            config.database_path(data_dir),
            PathBuf::from("/var/lib/murmur/murmur.db")
        );
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::from_dir(dir.path());
        fs::write(store.path(), "{ not json").expect("write");
        assert!(store.load_or_init().is_err());
    }
}
