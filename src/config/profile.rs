//! Connector profiles

use crate::core::connector::LinkOptions;
use crate::core::retry::RetryPolicy;
use crate::core::transport::ConnectorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Profile loading and saving errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not a valid profile
    #[error("{path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// The profile could not be encoded
    #[error("could not encode profile: {0}")]
    Encode(#[from] toml::ser::Error),

    /// No platform configuration directory
    #[error("could not determine config directory")]
    NoConfigDir,

    /// No profile with that name
    #[error("profile '{0}' not found")]
    NotFound(String),
}

/// Link timing as stored in a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Handshake bound in milliseconds
    pub handshake_timeout_ms: u64,
    /// Teardown grace period in milliseconds
    pub teardown_grace_ms: u64,
    /// Holder identity; generated when absent
    pub holder: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            teardown_grace_ms: 2_000,
            holder: None,
        }
    }
}

impl LinkSettings {
    /// Resolve into connector options
    pub fn to_options(&self) -> LinkOptions {
        let options = LinkOptions::default()
            .handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .teardown_grace(Duration::from_millis(self.teardown_grace_ms));
        match &self.holder {
            Some(holder) => options.holder(holder),
            None => options,
        }
    }
}

/// Saved connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorProfile {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Transport settings
    pub connector: ConnectorConfig,
    /// Timing and identity
    #[serde(default)]
    pub link: LinkSettings,
    /// Busy-line retry; a single attempt when absent
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl ConnectorProfile {
    /// Profile with default link settings
    pub fn new(name: &str, connector: ConnectorConfig) -> Self {
        Self {
            name: Some(name.to_string()),
            connector,
            link: LinkSettings::default(),
            retry: None,
        }
    }

    /// Parse a profile from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a profile file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut profile = Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if profile.name.is_none() {
            profile.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        Ok(profile)
    }

    /// Write the profile to `path`
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find a profile by file path, or by name in `dir`
    pub fn resolve_in(name_or_path: &str, dir: &Path) -> Result<Self, ConfigError> {
        let direct = Path::new(name_or_path);
        if direct.is_file() {
            return Self::load(direct);
        }

        let named = dir.join(format!("{name_or_path}.toml"));
        if named.is_file() {
            return Self::load(&named);
        }
        Err(ConfigError::NotFound(name_or_path.to_string()))
    }

    /// Find a profile by file path, or by name in the profile directory
    pub fn resolve(name_or_path: &str) -> Result<Self, ConfigError> {
        let dir = super::profile_dir().ok_or(ConfigError::NoConfigDir)?;
        Self::resolve_in(name_or_path, &dir)
    }

    /// Name for display
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.connector.resource())
    }
}
