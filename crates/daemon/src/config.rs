//! Configuration management for the Sharegate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sharegate/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("chunk_size must be between 64 KiB and 256 MiB, got {0}")]
    InvalidChunkSize(u64),

    #[error("max_size must be greater than 0, got {0}")]
    InvalidMaxSize(u64),

    #[error("session_ttl_secs must be at least 60 seconds, got {0}")]
    InvalidSessionTtl(u64),

    #[error("reaper_interval_secs must be between 1 and session_ttl_secs, got {0}")]
    InvalidReaperInterval(u64),

    #[error("{field} must be an absolute path, got {path}")]
    RelativePath { field: &'static str, path: String },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MIN_CHUNK_SIZE: u64 = 64 * 1024;
const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Main configuration structure for the Sharegate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Share registry configuration.
    pub shares: SharesConfig,

    /// Chunked upload configuration.
    pub upload: UploadConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (share registry, upload quarantine).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Where share definitions live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SharesConfig {
    /// JSON registry file. Defaults to `<data_dir>/shares.json`.
    pub registry_path: Option<PathBuf>,
}

/// Chunked upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Quarantine directory for partial uploads. Defaults to `<data_dir>/uploads`.
    pub temp_dir: Option<PathBuf>,

    /// Size of every chunk except the last, in bytes (default: 10 MiB).
    pub chunk_size: u64,

    /// Largest accepted upload in bytes (default: 10 GiB).
    pub max_size: u64,

    /// Sessions that have not completed within this many seconds are expired.
    pub session_ttl_secs: u64,

    /// How often the reaper scans for stale sessions.
    pub reaper_interval_secs: u64,

    /// Free space that must remain on a volume after an upload lands on it
    /// (default: 1 GiB).
    pub min_free_space: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            chunk_size: 10 * 1024 * 1024,
            max_size: 10 * 1024 * 1024 * 1024,
            session_ttl_secs: 24 * 60 * 60,
            reaper_interval_secs: 5 * 60,
            min_free_space: 1024 * 1024 * 1024,
        }
    }
}

impl UploadConfig {
    /// Session time-to-live.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Reaper scan interval.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharegate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharegate")
}

impl Config {
    /// Path of the JSON share registry.
    pub fn registry_path(&self) -> PathBuf {
        self.shares
            .registry_path
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("shares.json"))
    }

    /// Path of the upload quarantine directory.
    pub fn upload_temp_dir(&self) -> PathBuf {
        self.upload
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("uploads"))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHAREGATE_DATA_DIR: Override the data directory
    /// - SHAREGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SHAREGATE_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!(data_dir = %dir, "Overriding data_dir from environment");
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(level) = std::env::var("SHAREGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(log_level = %level, "Overriding log_level from environment");
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunk = self.upload.chunk_size;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.upload.max_size == 0 {
            return Err(ConfigError::InvalidMaxSize(self.upload.max_size));
        }

        if self.upload.session_ttl_secs < 60 {
            return Err(ConfigError::InvalidSessionTtl(self.upload.session_ttl_secs));
        }

        let interval = self.upload.reaper_interval_secs;
        if interval == 0 || interval > self.upload.session_ttl_secs {
            return Err(ConfigError::InvalidReaperInterval(interval));
        }

        require_absolute("daemon.data_dir", &self.daemon.data_dir)?;
        if let Some(path) = &self.shares.registry_path {
            require_absolute("shares.registry_path", path)?;
        }
        if let Some(path) = &self.upload.temp_dir {
            require_absolute("upload.temp_dir", path)?;
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn require_absolute(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::RelativePath {
            field,
            path: path.display().to_string(),
        })
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/var/lib/sharegate");
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.data_dir.to_string_lossy().contains("sharegate"));
        assert_eq!(config.shares.registry_path, None);
        assert_eq!(config.upload.chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.upload.session_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.upload.min_free_space, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_derived_paths() {
        let mut config = valid_config();
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/var/lib/sharegate/shares.json")
        );
        assert_eq!(
            config.upload_temp_dir(),
            PathBuf::from("/var/lib/sharegate/uploads")
        );

        config.upload.temp_dir = Some(PathBuf::from("/scratch/uploads"));
        assert_eq!(config.upload_temp_dir(), PathBuf::from("/scratch/uploads"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[upload]
chunk_size = 1048576
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.upload.chunk_size, 1_048_576);
        assert_eq!(config.upload.session_ttl_secs, 86_400);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[shares]
registry_path = "/etc/sharegate/shares.json"

[upload]
temp_dir = "/scratch/uploads"
chunk_size = 5242880
max_size = 1073741824
session_ttl_secs = 3600
reaper_interval_secs = 60
min_free_space = 0
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/etc/sharegate/shares.json")
        );
        assert_eq!(config.upload_temp_dir(), PathBuf::from("/scratch/uploads"));
        assert_eq!(config.upload.chunk_size, 5_242_880);
        assert_eq!(config.upload.max_size, 1_073_741_824);
        assert_eq!(config.upload.reaper_interval(), Duration::from_secs(60));
        assert_eq!(config.upload.min_free_space, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = \"debug\"\n");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[upload]\nchunk_size = \"big\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = valid_config();
        original.daemon.log_level = "warn".to_string();
        original.upload.temp_dir = Some(PathBuf::from("/tmp/up"));
        original.upload.max_size = 42;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = valid_config();
        original.upload.chunk_size = 2 * 1024 * 1024;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("sharegate"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_data_dir() {
        std::env::set_var("SHAREGATE_DATA_DIR", "/srv/sharegate");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHAREGATE_DATA_DIR");

        assert_eq!(config.daemon.data_dir, PathBuf::from("/srv/sharegate"));
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/srv/sharegate/shares.json")
        );
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("SHAREGATE_LOG_LEVEL", "debug");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHAREGATE_LOG_LEVEL");

        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SHAREGATE_LOG_LEVEL", "");
        std::env::remove_var("SHAREGATE_DATA_DIR");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("SHAREGATE_LOG_LEVEL");

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_shape() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_chunk_size_bounds() {
        let mut config = valid_config();
        config.upload.chunk_size = 1024;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize(1024)));

        config.upload.chunk_size = MIN_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        config.upload.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidChunkSize(_))
        ));
    }

    #[test]
    fn test_validate_max_size_zero() {
        let mut config = valid_config();
        config.upload.max_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSize(0)));
    }

    #[test]
    fn test_validate_ttl_and_interval() {
        let mut config = valid_config();
        config.upload.session_ttl_secs = 30;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSessionTtl(30)));

        let mut config = valid_config();
        config.upload.reaper_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReaperInterval(0)));

        config.upload.session_ttl_secs = 120;
        config.upload.reaper_interval_secs = 121;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidReaperInterval(121))
        );
    }

    #[test]
    fn test_validate_relative_paths() {
        let mut config = valid_config();
        config.upload.temp_dir = Some(PathBuf::from("uploads"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath {
                field: "upload.temp_dir",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
