//! Configuration for the logging system

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main logging configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log level for all modules ("TRACE" .. "ERROR")
    pub level: String,
    /// Colored output: "auto", "always" or "never"
    pub write_style: String,
    /// Per-module level overrides, e.g. `jobstage::transfer = "DEBUG"`
    pub module_levels: HashMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            write_style: "auto".to_string(),
            module_levels: HashMap::new(),
        }
    }
}

impl LogConfig {
    /// Create a configuration with the given default level
    pub fn with_level(level: &str) -> Self {
        Self {
            level: level.to_string(),
            ..Default::default()
        }
    }

    /// Check that every configured level and the write style are recognised
    pub fn validate(&self) -> Result<(), String> {
        parse_level(&self.level)?;
        for (module, level) in &self.module_levels {
            parse_level(level).map_err(|e| format!("{} (module '{}')", e, module))?;
        }
        match self.write_style.as_str() {
            "auto" | "always" | "never" => Ok(()),
            other => Err(format!("Invalid write style: {}", other)),
        }
    }
}

/// Parse a textual log level into a `log::LevelFilter`
pub fn parse_level(level: &str) -> Result<log::LevelFilter, String> {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(log::LevelFilter::Trace),
        "DEBUG" => Ok(log::LevelFilter::Debug),
        "INFO" => Ok(log::LevelFilter::Info),
        "WARN" => Ok(log::LevelFilter::Warn),
        "ERROR" => Ok(log::LevelFilter::Error),
        "OFF" => Ok(log::LevelFilter::Off),
        _ => Err(format!("Invalid log level: {}", level)),
    }
}
