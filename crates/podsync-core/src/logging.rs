//! Tracing setup for applications embedding the pipeline.
//!
//! The pipeline logs through `tracing` from worker threads named
//! `podsync-convert-<slot>` and `podsync-transfer-<device>`, so thread names
//! are part of every line. Output goes to the console in human-readable form
//! and to a rotating JSON file.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crate targets that get the configured verbosity; everything else logs warnings only.
const OWN_TARGETS: &[&str] = &["podsync", "podsync_core"];

/// How often the log file is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// Every hour.
    Hourly,
    /// Every day.
    Daily,
    /// Single file.
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory for log files; `None` disables file output.
    pub log_directory: Option<PathBuf>,
    /// File name prefix, e.g. "podsync" -> "podsync.2024-01-15".
    pub file_prefix: String,
    /// Console verbosity for this crate.
    pub console_level: Level,
    /// File verbosity for this crate.
    pub file_level: Level,
    /// File rotation.
    pub rotation: LogRotation,
    /// ANSI colours on the console.
    pub console_ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::verbose()
        } else {
            Self::quiet()
        }
    }
}

impl LogSettings {
    /// Debug on the console, trace in hourly files.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            log_directory: Some(default_log_directory()),
            file_prefix: "podsync".to_string(),
            console_level: Level::DEBUG,
            file_level: Level::TRACE,
            rotation: LogRotation::Hourly,
            console_ansi: true,
        }
    }

    /// Info on the console, debug in daily files.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            console_level: Level::INFO,
            file_level: Level::DEBUG,
            rotation: LogRotation::Daily,
            ..Self::verbose()
        }
    }

    /// Set the log directory.
    #[must_use]
    pub fn with_log_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(path.into());
        self
    }

    /// Log to the console only.
    #[must_use]
    pub fn without_file(mut self) -> Self {
        self.log_directory = None;
        self
    }

    /// Set the console level.
    #[must_use]
    pub const fn with_console_level(mut self, level: Level) -> Self {
        self.console_level = level;
        self
    }
}

/// Keeps the background file writer alive; drop it to flush.
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// Directory.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// A filter directive did not parse.
    #[error("Invalid log filter '{directives}': {reason}")]
    InvalidFilter {
        /// Directive string.
        directives: String,
        /// Failure detail.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the console filter.
pub fn init(settings: &LogSettings) -> Result<LoggingGuard, LoggingError> {
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => filter_for(settings.console_level)?,
    };
    let console_layer = fmt::layer()
        .with_ansi(settings.console_ansi)
        .with_thread_names(true)
        .with_target(false)
        .with_filter(console_filter);

    let (file_layer, file_guard) = match settings.log_directory.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| LoggingError::DirectoryCreationFailed {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            let appender =
                RollingFileAppender::new(settings.rotation.into(), dir, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_filter(filter_for(settings.file_level)?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Route logs to the test harness output. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_thread_names(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("podsync_core=debug")),
        )
        .try_init();
}

/// Default log directory.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podsync")
        .join("logs")
}

fn filter_for(level: Level) -> Result<EnvFilter, LoggingError> {
    let directives = directives_for(level);
    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
        directives,
        reason: e.to_string(),
    })
}

fn directives_for(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = String::from("warn");
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}
