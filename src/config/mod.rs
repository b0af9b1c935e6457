//! Configuration for the staging proxy
//!
//! `ProxyConfig` is usually loaded from a TOML file; every field has a default
//! so a partial file (or no file at all) yields a usable configuration.

use crate::constants::{DEFAULT_SESSION_NAME, DEFAULT_TRANSFER_WORKERS, STORE_DIR_NAME};
use crate::error::{ProxyError, ProxyResult};
use crate::logging::LogConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

static SESSION_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]+$").expect("session name pattern is a valid regex")
});

/// Configuration for a `DataProxy` instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Name scoping the persisted awaited-job store
    pub session_name: String,
    /// Base directory holding one store per session name
    pub store_dir: PathBuf,
    /// Number of concurrent transfer workers
    pub transfer_workers: usize,
    /// Reset `transferring` flags left behind by a crash when the store is loaded
    pub clear_transferring_on_load: bool,
    /// Logging configuration
    pub logging: LogConfig,
}

/// Default base directory: the platform cache dir, or the OS temp dir.
pub fn default_store_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STORE_DIR_NAME)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            store_dir: default_store_dir(),
            transfer_workers: DEFAULT_TRANSFER_WORKERS,
            clear_transferring_on_load: true,
            logging: LogConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Create a configuration storing its sessions under `store_dir`
    pub fn new(store_dir: PathBuf) -> Self {
        Self {
            store_dir,
            ..Default::default()
        }
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> ProxyResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml_str(content: &str) -> ProxyResult<Self> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the session name
    pub fn with_session_name(mut self, name: &str) -> Self {
        self.session_name = name.to_string();
        self
    }

    /// Set the number of transfer workers
    pub fn with_transfer_workers(mut self, workers: usize) -> Self {
        self.transfer_workers = workers;
        self
    }

    /// Path of the store directory for the configured session
    pub fn session_store_path(&self) -> PathBuf {
        self.store_dir.join(&self.session_name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ProxyResult<()> {
        validate_session_name(&self.session_name)?;
        if self.transfer_workers == 0 {
            return Err(ProxyError::Config(
                "transfer_workers must be at least 1".to_string(),
            ));
        }
        self.logging.validate().map_err(ProxyError::Config)
    }
}

/// Session names end up in file names, so only ASCII alphanumerics are accepted.
pub fn validate_session_name(name: &str) -> ProxyResult<()> {
    if SESSION_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ProxyError::InvalidArgument(format!(
            "session name '{}' must be non-empty and alphanumeric",
            name
        )))
    }
}
