use std::{fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use common::prelude::TaskExecutorConfig;

use crate::database::types::LogLevel;
use crate::fuse::ContentCacheConfig;
use crate::service::ServiceFlags;
use crate::service_config::Config as ServiceConfig;

pub const APP_NAME: &str = "cloudfs";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DB_FILE_NAME: &str = "mounts.sqlite";
pub const CACHE_DIR_NAME: &str = "cache";
pub const LOGS_DIR_NAME: &str = "logs";
pub const REMOTE_DIR_NAME: &str = "remote";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory standing in for the cloud tree (defaults to <state dir>/remote)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_root: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Seconds `disable` waits for in-flight requests
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub content_cache: ContentCacheConfig,
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_max_workers() -> usize {
    16
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            remote_root: None,
            log_level: LogLevel::default(),
            drain_timeout_secs: default_drain_timeout(),
            max_workers: default_max_workers(),
            content_cache: ContentCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the state directory (~/.cloudfs)
    pub state_dir: PathBuf,
    /// Path to the mount database
    pub db_path: PathBuf,
    /// Path to the per-mount inode stores
    pub cache_dir: PathBuf,
    /// Path to the log directory
    pub logs_dir: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the state directory path (custom or default ~/.cloudfs)
    pub fn state_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Initialize a new state directory
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        if state_dir.exists() {
            return Err(StateError::AlreadyInitialized);
        }

        fs::create_dir_all(&state_dir)?;

        let cache_dir = state_dir.join(CACHE_DIR_NAME);
        fs::create_dir_all(&cache_dir)?;
        let logs_dir = state_dir.join(LOGS_DIR_NAME);
        fs::create_dir_all(&logs_dir)?;

        let config = config.unwrap_or_default();
        if config.remote_root.is_none() {
            fs::create_dir_all(state_dir.join(REMOTE_DIR_NAME))?;
        }

        let config_path = state_dir.join(CONFIG_FILE_NAME);
        let config_toml = toml::to_string_pretty(&config)?;
        fs::write(&config_path, config_toml)?;

        // The service builds the schema on first open
        let db_path = state_dir.join(DB_FILE_NAME);

        Ok(Self {
            state_dir,
            db_path,
            cache_dir,
            logs_dir,
            config_path,
            config,
        })
    }

    /// Load existing state from the state directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        if !state_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let db_path = state_dir.join(DB_FILE_NAME);
        let cache_dir = state_dir.join(CACHE_DIR_NAME);
        let logs_dir = state_dir.join(LOGS_DIR_NAME);
        let config_path = state_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }
        if !cache_dir.exists() {
            return Err(StateError::MissingFile(format!("{}/", CACHE_DIR_NAME)));
        }

        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        Ok(Self {
            state_dir,
            db_path,
            cache_dir,
            logs_dir,
            config_path,
            config,
        })
    }

    /// Write the current configuration back to disk
    pub fn save(&self) -> Result<(), StateError> {
        let config_toml = toml::to_string_pretty(&self.config)?;
        fs::write(&self.config_path, config_toml)?;
        Ok(())
    }

    /// Directory the local client serves as the cloud tree
    pub fn remote_root(&self) -> PathBuf {
        self.config
            .remote_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join(REMOTE_DIR_NAME))
    }

    /// Runtime configuration for the mount service
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            sqlite_path: Some(self.db_path.clone()),
            cache_dir: Some(self.cache_dir.clone()),
            executor: TaskExecutorConfig {
                max_workers: self.config.max_workers,
                ..Default::default()
            },
            content_cache: self.config.content_cache,
            flags: ServiceFlags {
                log_level: self.config.log_level,
                drain_timeout: Duration::from_secs(self.config.drain_timeout_secs),
            },
            enable_startup_mounts: true,
            log_dir: Some(self.logs_dir.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state directory not initialized. Run 'cloudfs init' first")]
    NotInitialized,

    #[error("state directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let state = AppState::init(Some(state_dir.clone()), None).unwrap();
        assert!(state.cache_dir.exists());
        assert!(state.remote_root().exists());

        let loaded = AppState::load(Some(state_dir)).unwrap();
        assert_eq!(loaded.config, state.config);
        assert_eq!(loaded.db_path, state.db_path);
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        AppState::init(Some(state_dir.clone()), None).unwrap();
        assert!(matches!(
            AppState::init(Some(state_dir), None),
            Err(StateError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_load_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppState::load(Some(dir.path().join("missing"))),
            Err(StateError::NotInitialized)
        ));
    }

    #[test]
    fn test_saved_level_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");

        let mut state = AppState::init(Some(state_dir.clone()), None).unwrap();
        state.config.log_level = LogLevel::Debug;
        state.save().unwrap();

        let loaded = AppState::load(Some(state_dir)).unwrap();
        assert_eq!(loaded.config.log_level, LogLevel::Debug);
        assert_eq!(loaded.service_config().flags.log_level, LogLevel::Debug);
    }
}
