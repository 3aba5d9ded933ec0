//! # depot-config
//!
//! Configuration management for depot.
//!
//! Loads configuration from:
//! 1. `~/.depot/config.toml` (global)
//! 2. `.depot/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::logging::LogLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub gc: GcConfig,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.depot/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::parse_file(&global_path)?;
            }
        }

        // 2. Project config (.depot/config.toml) overrides global
        let project_path = Path::new(".depot/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::parse_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load a single explicit config file, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::parse_file(path.as_ref())?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.depot/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".depot/config.toml"))
    }

    /// Merge a project config on top of this one.
    ///
    /// Only values that differ from the defaults override.
    fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.checkout_dir.is_some() {
            self.storage.checkout_dir = other.storage.checkout_dir;
        }
        if !other.storage.enabled {
            self.storage.enabled = false;
        }
        if other.gc.period_secs != defaults.gc.period_secs {
            self.gc.period_secs = other.gc.period_secs;
        }
        if other.gc.max_age_secs != defaults.gc.max_age_secs {
            self.gc.max_age_secs = other.gc.max_age_secs;
        }
        if !other.gc.extra_checkout_dirs.is_empty() {
            self.gc.extra_checkout_dirs = other.gc.extra_checkout_dirs;
        }
        if other.gc.silently_disable {
            self.gc.silently_disable = true;
        }
        if other.upload.defer_timeout_secs != defaults.upload.defer_timeout_secs {
            self.upload.defer_timeout_secs = other.upload.defer_timeout_secs;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DEPOT_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("DEPOT_CHECKOUT_DIR") {
            self.storage.checkout_dir = Some(PathBuf::from(path));
        }
        if let Ok(secs) = std::env::var("DEPOT_GC_PERIOD_SECS") {
            if let Ok(n) = secs.parse() {
                self.gc.period_secs = n;
            }
        }
        if let Ok(secs) = std::env::var("DEPOT_GC_MAX_AGE_SECS") {
            if let Ok(n) = secs.parse() {
                self.gc.max_age_secs = n;
            }
        }
        if let Ok(level) = std::env::var("DEPOT_LOG") {
            if let Ok(level) = level.parse() {
                self.logging.level = level;
            }
        }
    }

    /// Check the values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.root is empty".to_string()));
        }
        if self.gc.is_enabled() {
            if self.gc.max_age_secs == 0 {
                return Err(ConfigError::Invalid(
                    "gc.max_age_secs must be > 0 while garbage collection is enabled".to_string(),
                ));
            }
            // Live checkouts are only protected if they are refreshed well
            // within the retention window.
            if self.gc.max_age_secs <= self.gc.period_secs {
                warn!(
                    max_age_secs = self.gc.max_age_secs,
                    period_secs = self.gc.period_secs,
                    "gc.max_age_secs should be much larger than gc.period_secs"
                );
            }
        }
        Ok(())
    }

    /// Root of the blob area: `<root>/file-store`.
    pub fn file_store_path(&self) -> PathBuf {
        path::expand_home(&self.storage.root).join("file-store")
    }

    /// Root of the checkout area: `checkout_dir`, or `<root>/jobs`.
    pub fn checkout_path(&self) -> PathBuf {
        match &self.storage.checkout_dir {
            Some(dir) => path::expand_home(dir),
            None => path::expand_home(&self.storage.root).join("jobs"),
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Whether the store is served at all
    pub enabled: bool,
    /// Storage root; blobs live in `<root>/file-store`
    pub root: PathBuf,
    /// Checkout root, `<root>/jobs` when unset
    pub checkout_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("~/.depot"),
            checkout_dir: None,
        }
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between sweeps; 0 disables collection
    pub period_secs: u64,
    /// Blobs untouched for longer than this are eligible for deletion
    pub max_age_secs: u64,
    /// Extra directories whose symlinks keep blobs alive
    pub extra_checkout_dirs: Vec<PathBuf>,
    /// Disable collection without complaining about it
    pub silently_disable: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            period_secs: 24 * 3600,
            max_age_secs: 31 * 24 * 3600,
            extra_checkout_dirs: Vec::new(),
            silently_disable: false,
        }
    }
}

impl GcConfig {
    pub fn is_enabled(&self) -> bool {
        self.period_secs > 0 && !self.silently_disable
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn extra_checkout_dirs(&self) -> Vec<PathBuf> {
        self.extra_checkout_dirs
            .iter()
            .map(|d| path::expand_home(d))
            .collect()
    }
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// How long a deferring upload waits for an identical concurrent upload
    pub defer_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            defer_timeout_secs: 600,
        }
    }
}

impl UploadConfig {
    pub fn defer_timeout(&self) -> Duration {
        Duration::from_secs(self.defer_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}
