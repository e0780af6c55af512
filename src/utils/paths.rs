//! Cross-Platform Path Utilities
//!
//! Resolves the application directory (~/.deep-query/) and the files kept
//! inside it.

use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Get the user's home directory
pub fn home_dir() -> AppResult<PathBuf> {
    dirs::home_dir().ok_or_else(|| AppError::config("Could not determine home directory"))
}

/// Get the application directory (~/.deep-query/)
pub fn deep_query_dir() -> AppResult<PathBuf> {
    Ok(home_dir()?.join(".deep-query"))
}

/// Get the config file path (~/.deep-query/config.json)
pub fn config_path() -> AppResult<PathBuf> {
    Ok(deep_query_dir()?.join("config.json"))
}

/// Get the default analysis store directory (~/.deep-query/analyses/)
pub fn analyses_dir() -> AppResult<PathBuf> {
    Ok(deep_query_dir()?.join("analyses"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> AppResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
