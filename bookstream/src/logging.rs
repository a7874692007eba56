//! Logging setup.
//!
//! Installs a global `tracing` subscriber writing to stderr, plus an optional
//! daily-rolling log file. The filter comes from `BOOKSTREAM_LOG` when set
//! (standard `EnvFilter` syntax), otherwise from the configured level.

use std::path::{Path, PathBuf};

use thiserror::Error;
use time::macros::format_description;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Environment variable overriding the configured filter.
pub const LOG_ENV_VAR: &str = "BOOKSTREAM_LOG";

/// Level used when neither the config nor the environment names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("log file path has no file name: {0}")]
    InvalidFile(PathBuf),

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Logging settings, usually from the `[logging]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `bookstream=debug,warn`.
    pub level: String,
    /// Also log to this file, rotated daily.
    pub file: Option<PathBuf>,
    /// Include target module paths in stderr output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
            with_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Keeps the file writer flushing. Hold it for the life of the program.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(directives) = std::env::var(LOG_ENV_VAR) {
        if !directives.trim().is_empty() {
            return EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
                filter: directives.clone(),
                message: e.to_string(),
            });
        }
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter {
        filter: level.to_string(),
        message: e.to_string(),
    })
}

fn split_file(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError> {
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}

/// Install the global subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer.clone())
        .with_target(config.with_target)
        .with_filter(build_filter(&config.level)?);

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (dir, name) = split_file(path)?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_timer(timer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(build_filter(&config.level)?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(LoggingGuard { _file: guard })
}
