#![warn(missing_docs)]

//! # chartbox-config
//!
//! Configuration loading for the chartbox callback sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every setting is optional; unset values fall back to the sandbox defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! memory_limit_mb = 128
//! idle_timeout_secs = 120
//! reap_interval_secs = 60
//! compile_timeout_ms = 3000
//! invoke_timeout_ms = ${CHARTBOX_INVOKE_MS}
//! max_source_bytes = 65536
//! max_contexts = 1024
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CHARTBOX_CONFIG";

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chartbox.toml";

/// Smallest accepted heap ceiling, in megabytes.
pub const MIN_MEMORY_LIMIT_MB: usize = 8;

/// Largest accepted heap ceiling, in megabytes.
pub const MAX_MEMORY_LIMIT_MB: usize = 16 * 1024;

/// Largest accepted compile or invoke budget (one hour), in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Largest accepted idle timeout or sweep interval (one day), in seconds.
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level chartbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChartboxConfig {
    /// Sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// V8 heap ceiling in megabytes.
    #[serde(default)]
    pub memory_limit_mb: Option<usize>,

    /// Idle time after which a context is reclaimed, in seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Interval between idle sweeps, in seconds.
    #[serde(default)]
    pub reap_interval_secs: Option<u64>,

    /// Budget for compiling one callback, in milliseconds.
    #[serde(default)]
    pub compile_timeout_ms: Option<u64>,

    /// Budget for one callback invocation, in milliseconds.
    #[serde(default)]
    pub invoke_timeout_ms: Option<u64>,

    /// Largest accepted callback source, in bytes.
    #[serde(default)]
    pub max_source_bytes: Option<usize>,

    /// Maximum number of live contexts.
    #[serde(default)]
    pub max_contexts: Option<usize>,
}

impl ChartboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ChartboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sandbox;
        let checks: [(&str, Option<u64>); 7] = [
            ("memory_limit_mb", s.memory_limit_mb.map(|v| v as u64)),
            ("idle_timeout_secs", s.idle_timeout_secs),
            ("reap_interval_secs", s.reap_interval_secs),
            ("compile_timeout_ms", s.compile_timeout_ms),
            ("invoke_timeout_ms", s.invoke_timeout_ms),
            ("max_source_bytes", s.max_source_bytes.map(|v| v as u64)),
            ("max_contexts", s.max_contexts.map(|v| v as u64)),
        ];
        for (name, value) in checks {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }
        if let Some(mb) = s.memory_limit_mb {
            if mb < MIN_MEMORY_LIMIT_MB {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.memory_limit_mb must be at least {MIN_MEMORY_LIMIT_MB} (got {mb})"
                )));
            }
        }

        let ceilings: [(&str, Option<u64>, u64); 5] = [
            (
                "memory_limit_mb",
                s.memory_limit_mb.map(|v| v as u64),
                MAX_MEMORY_LIMIT_MB as u64,
            ),
            ("idle_timeout_secs", s.idle_timeout_secs, MAX_INTERVAL_SECS),
            ("reap_interval_secs", s.reap_interval_secs, MAX_INTERVAL_SECS),
            ("compile_timeout_ms", s.compile_timeout_ms, MAX_TIMEOUT_MS),
            ("invoke_timeout_ms", s.invoke_timeout_ms, MAX_TIMEOUT_MS),
        ];
        for (name, value, max) in ceilings {
            if let Some(value) = value.filter(|&v| v > max) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be at most {max} (got {value})"
                )));
            }
        }
        Ok(())
    }
}

/// Locate the config file: `$CHARTBOX_CONFIG` if it names an existing file,
/// else `./chartbox.toml` if present.
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders are kept so the parse error names them.
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
