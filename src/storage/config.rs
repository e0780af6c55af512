//! Config File
//!
//! Loads `config.json`, seeding it with defaults on first run, and layers
//! environment overrides on top.

use std::fs;
use std::path::{Path, PathBuf};

use crate::models::settings::AppConfig;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_dir};

/// Effective configuration and the file it came from.
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigService {
    /// Load the config at `path` (or ~/.deep-query/config.json), writing
    /// defaults first when the file does not exist. Environment overrides are
    /// applied after validation and are never written back.
    pub fn new(path: Option<PathBuf>) -> AppResult<Self> {
        let config_path = match path {
            Some(p) => p,
            None => config_path()?,
        };
        if let Some(parent) = config_path.parent() {
            ensure_dir(parent)?;
        }

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            let default_config = AppConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            tracing::info!(path = %config_path.display(), "wrote default configuration");
            default_config
        };
        config.apply_env_overrides();

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Parse and validate; a file that fails validation is an error.
    fn load_from_file(path: &Path) -> AppResult<AppConfig> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate().map_err(AppError::config)?;
        Ok(config)
    }

    fn save_to_file(path: &Path, config: &AppConfig) -> AppResult<()> {
        config.validate().map_err(AppError::config)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn get_config_clone(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
