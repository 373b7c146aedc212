//! Configuration module
//!
//! Handles connector profiles stored as TOML files

mod profile;

pub use profile::{ConfigError, ConnectorProfile, LinkSettings};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "labconsole", "labconsole").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the profile directory
pub fn profile_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("profiles"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    if let Some(dir) = profile_dir() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
