//! Pipeline configuration management.
//!
//! Handles loading, saving, and validating the settings that drive the
//! conversion cache and the background transfer workers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};

/// Default maximum conversion cache size in bytes (4 GB).
pub const DEFAULT_MAX_CACHE_SIZE: i64 = 4 * 1024 * 1024 * 1024;

/// Default template for converted file names.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%A/%t_%T";

/// Default scheduling tick period in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

/// Default number of lines kept per worker log page.
pub const DEFAULT_LOG_MAX_LINES: usize = 500;

/// Upper bound for `max_workers`.
pub const MAX_WORKERS_LIMIT: usize = 64;

/// Description of one file type understood by the built-in classifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTypeConfig {
    /// Type token, e.g. "flac".
    pub name: String,
    /// File name suffixes matched case-insensitively, without the dot.
    pub suffixes: Vec<String>,
    /// Whether files of this type may be converted.
    #[serde(default = "default_true")]
    pub can_convert: bool,
    /// Whether the device cannot play this type without conversion.
    #[serde(default)]
    pub must_convert: bool,
    /// Conversion command line, if any.
    #[serde(default)]
    pub conversion_command: Option<String>,
}

impl FileTypeConfig {
    /// Create a type entry matching the given suffix.
    #[must_use]
    pub fn new(name: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suffixes: vec![suffix.into()],
            can_convert: true,
            must_convert: false,
            conversion_command: None,
        }
    }

    /// Set the conversion command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.conversion_command = Some(command.into());
        self
    }

    /// Mark conversion as mandatory.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.must_convert = true;
        self
    }

    /// Mark the type as never converted.
    #[must_use]
    pub const fn passthrough(mut self) -> Self {
        self.can_convert = false;
        self
    }
}

/// Conversion and transfer pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory holding converted files.
    /// If not set, uses the platform cache location.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum cache size in bytes. Zero or less disables caching.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: i64,

    /// Template for converted file names, relative to the cache directory.
    #[serde(default = "default_filename_template")]
    pub filename_template: String,

    /// Maximum concurrent conversion workers (0 = available processors).
    #[serde(default)]
    pub max_workers: usize,

    /// Whether transfer workers may run in the background by default.
    #[serde(default = "default_true")]
    pub background_transfer: bool,

    /// Whether worker output is kept for display.
    #[serde(default = "default_true")]
    pub display_log: bool,

    /// Lines kept per worker log page.
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,

    /// Compare SHA-256 checksums after each copy.
    #[serde(default)]
    pub verify_transfers: bool,

    /// Kill conversions running longer than this many seconds.
    #[serde(default)]
    pub conversion_timeout_secs: Option<u64>,

    /// Scheduling tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// File types known to the built-in classifier.
    #[serde(default)]
    pub file_types: Vec<FileTypeConfig>,
}

const fn default_true() -> bool {
    true
}

const fn default_max_cache_size() -> i64 {
    DEFAULT_MAX_CACHE_SIZE
}

fn default_filename_template() -> String {
    DEFAULT_FILENAME_TEMPLATE.to_string()
}

const fn default_log_max_lines() -> usize {
    DEFAULT_LOG_MAX_LINES
}

const fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            filename_template: default_filename_template(),
            max_workers: 0,
            background_transfer: true,
            display_log: true,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            verify_transfers: false,
            conversion_timeout_secs: None,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            file_types: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Set the maximum cache size in bytes.
    #[must_use]
    pub const fn with_max_cache_size(mut self, bytes: i64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Set the maximum number of conversion workers.
    #[must_use]
    pub const fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Set the file name template.
    #[must_use]
    pub fn with_filename_template(mut self, template: impl Into<String>) -> Self {
        self.filename_template = template.into();
        self
    }

    /// Enable or disable background transfer.
    #[must_use]
    pub const fn with_background_transfer(mut self, enabled: bool) -> Self {
        self.background_transfer = enabled;
        self
    }

    /// Add a file type to the built-in classifier table.
    #[must_use]
    pub fn with_file_type(mut self, file_type: FileTypeConfig) -> Self {
        self.file_types.push(file_type);
        self
    }

    /// Resolved cache directory.
    #[must_use]
    pub fn cache_directory(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_directory)
    }

    /// Quota in bytes; negative sizes collapse to zero.
    #[must_use]
    pub fn quota_bytes(&self) -> u64 {
        u64::try_from(self.max_cache_size).unwrap_or(0)
    }

    /// Number of conversion worker slots, resolving 0 to the processor count.
    #[must_use]
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            self.max_workers.min(MAX_WORKERS_LIMIT)
        }
    }

    /// Scheduling tick period.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Conversion timeout, if configured.
    #[must_use]
    pub fn conversion_timeout(&self) -> Option<Duration> {
        self.conversion_timeout_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.filename_template.trim().is_empty() {
            return Err(Error::Configuration(
                "Filename template must not be empty".to_string(),
            ));
        }
        if self.max_workers > MAX_WORKERS_LIMIT {
            return Err(Error::Configuration(format!(
                "max_workers must be at most {MAX_WORKERS_LIMIT}"
            )));
        }
        if self.conversion_timeout_secs == Some(0) {
            return Err(Error::Configuration(
                "conversion_timeout_secs must be positive when set".to_string(),
            ));
        }
        for file_type in &self.file_types {
            if file_type.suffixes.is_empty() {
                return Err(Error::Configuration(format!(
                    "File type '{}' has no suffixes",
                    file_type.name
                )));
            }
        }
        Ok(())
    }

    /// Load the configuration from the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load the configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        if let Err(e) = config.validate() {
            warn!("Loaded configuration is invalid: {}", e);
            return Err(e);
        }

        info!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    /// Save the configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        debug!("Saved pipeline configuration to {}", path.display());
        Ok(())
    }

    /// Path of the default config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Get the default conversion cache directory.
#[must_use]
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("podsync")
        .join("conversion_cache")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("podsync")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_cache_size, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.filename_template, "%A/%t_%T");
        assert!(config.background_transfer);
        assert!(config.display_log);
        assert!(!config.verify_transfers);
        assert!(config.conversion_timeout().is_none());
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quota_bytes_clamps_negative() {
        assert_eq!(PipelineConfig::new().with_max_cache_size(-5).quota_bytes(), 0);
        assert_eq!(PipelineConfig::new().with_max_cache_size(0).quota_bytes(), 0);
        assert_eq!(PipelineConfig::new().with_max_cache_size(1024).quota_bytes(), 1024);
    }

    #[test]
    fn test_effective_max_workers() {
        assert!(PipelineConfig::new().effective_max_workers() >= 1);
        assert_eq!(PipelineConfig::new().with_max_workers(3).effective_max_workers(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::new().with_filename_template("  ").validate().is_err());
        assert!(PipelineConfig::new().with_max_workers(1000).validate().is_err());

        let mut config = PipelineConfig::new();
        config.conversion_timeout_secs = Some(0);
        assert!(config.validate().is_err());

        let mut no_suffix = FileTypeConfig::new("flac", "flac");
        no_suffix.suffixes.clear();
        assert!(PipelineConfig::new().with_file_type(no_suffix).validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("nested").join("config.json");

        let config = PipelineConfig::new()
            .with_cache_dir(temp.path().join("cache"))
            .with_max_workers(2)
            .with_file_type(FileTypeConfig::new("flac", "flac").with_command("/bin/flac2mp3").required());
        config.save_to(&path).expect("save config");

        let loaded = PipelineConfig::load_from(&path).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().expect("create temp dir");
        let loaded = PipelineConfig::load_from(&temp.path().join("absent.json")).expect("load");
        assert_eq!(loaded, PipelineConfig::default());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{"max_cache_size": 0, "display_log": false}"#).expect("write");

        let loaded = PipelineConfig::load_from(&path).expect("load");
        assert_eq!(loaded.max_cache_size, 0);
        assert!(!loaded.display_log);
        assert_eq!(loaded.filename_template, DEFAULT_FILENAME_TEMPLATE);
        assert!(loaded.background_transfer);
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            PipelineConfig::load_from(&path),
            Err(Error::Configuration(_))
        ));
    }
}
