//! # Logging System
//!
//! Installs an `env_logger` backend behind the `log` facade used throughout
//! the crate. `RUST_LOG` still takes precedence over the configured levels.

pub mod config;

pub use config::LogConfig;

use env_logger::{Builder, Env, WriteStyle};
use once_cell::sync::OnceCell;

/// Configuration the logger was installed with
static LOGGING_CONFIG: OnceCell<LogConfig> = OnceCell::new();

/// Process-wide logging bootstrap
pub struct LoggingSystem;

impl LoggingSystem {
    /// Initialize the logging system with default configuration
    pub fn init_default() -> Result<(), LoggingError> {
        Self::init_with_config(LogConfig::default())
    }

    /// Initialize the logging system with a custom configuration
    pub fn init_with_config(config: LogConfig) -> Result<(), LoggingError> {
        config.validate().map_err(LoggingError::Config)?;
        if LOGGING_CONFIG.get().is_some() {
            return Err(LoggingError::AlreadyInitialized);
        }

        let mut builder = Builder::new();
        builder.filter_level(config::parse_level(&config.level).map_err(LoggingError::Config)?);
        for (module, level) in &config.module_levels {
            builder.filter_module(
                module,
                config::parse_level(level).map_err(LoggingError::Config)?,
            );
        }
        builder.write_style(match config.write_style.as_str() {
            "always" => WriteStyle::Always,
            "never" => WriteStyle::Never,
            _ => WriteStyle::Auto,
        });
        builder.parse_env(Env::default());
        builder
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;

        LOGGING_CONFIG
            .set(config)
            .map_err(|_| LoggingError::AlreadyInitialized)?;
        Ok(())
    }

    /// Get the configuration the logger was installed with
    pub fn config() -> Option<&'static LogConfig> {
        LOGGING_CONFIG.get()
    }
}

/// Logging system errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Logging system already initialized")]
    AlreadyInitialized,
    #[error("Configuration error: {0}")]
    Config(String),
}
