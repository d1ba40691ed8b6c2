//! Layered TOML configuration for toolgate.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolgate_client::{ConnectionMode, GatewayConfig};

/// Name of the config file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// Resolved configuration for a toolgate session.
#[derive(Debug, Clone)]
pub struct ToolgateConfig {
    pub gateway: GatewayConfig,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Explicit config file; when set it must exist.
    pub config_path: Option<PathBuf>,
    pub mode: Option<ConnectionMode>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub debug: bool,
}

impl ToolgateConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`TOOLGATE_*`)
    /// 3. Config file (`--config`, else ~/.toolgate/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let settings = match &overrides.config_path {
            Some(path) => read_settings_file(path)?,
            None => load_settings_file(&config_dir.join(CONFIG_FILE_NAME))?,
        };

        let mut gateway = settings.gateway;
        apply_env(&mut gateway, |key| std::env::var(key).ok())?;
        apply_overrides(&mut gateway, overrides);
        validate(&gateway)?;

        Ok(ToolgateConfig {
            gateway,
            config_dir,
        })
    }
}

/// Get the toolgate config directory path (~/.toolgate/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLGATE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate")
}

/// Load the default settings file; a missing file means defaults.
fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    if !path.exists() {
        tracing::debug!("No config file at {}; using defaults", path.display());
        return Ok(SettingsFile::default());
    }
    read_settings_file(path)
}

fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Apply `TOOLGATE_*` environment overrides. `lookup` is `std::env::var` in
/// production.
pub fn apply_env(
    config: &mut GatewayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(mode) = lookup("TOOLGATE_MODE") {
        config.mode = mode.parse().map_err(|message| ConfigError::InvalidValue {
            key: "TOOLGATE_MODE".into(),
            message,
        })?;
    }
    if let Some(host) = lookup("TOOLGATE_HOST") {
        config.host = host;
    }
    if let Some(port) = lookup("TOOLGATE_PORT") {
        config.port = port
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                key: "TOOLGATE_PORT".into(),
                message: e.to_string(),
            })?;
    }
    if let Some(command) = lookup("TOOLGATE_COMMAND") {
        config.command = command;
    }
    if let Some(debug) = lookup("TOOLGATE_DEBUG") {
        config.debug = matches!(
            debug.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
    }
    Ok(())
}

fn apply_overrides(config: &mut GatewayConfig, overrides: CliOverrides) {
    if let Some(mode) = overrides.mode {
        config.mode = mode;
    }
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(command) = overrides.command {
        config.command = command;
    }
    if let Some(args) = overrides.args {
        config.args = args;
    }
    if overrides.debug {
        config.debug = true;
    }
}

/// Reject settings the supervisor cannot work with.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    if config.mode == ConnectionMode::OwnedProcess && config.command.trim().is_empty() {
        return Err(ConfigError::MissingKey {
            key: "gateway.command (set TOOLGATE_COMMAND or add to ~/.toolgate/config.toml)"
                .into(),
        });
    }
    if config.max_port_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            key: "gateway.max_port_attempts".into(),
            message: "must be at least 1".into(),
        });
    }
    if config.port_increment == 0 {
        return Err(ConfigError::InvalidValue {
            key: "gateway.port_increment".into(),
            message: "must be at least 1".into(),
        });
    }
    if config.port_env.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "gateway.port_env".into(),
            message: "must not be empty".into(),
        });
    }
    Ok(())
}
