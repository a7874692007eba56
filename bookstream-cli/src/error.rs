//! CLI error type.

use std::fmt;

use bookstream::cache::CacheError;
use bookstream::config::ConfigError;
use bookstream::logging::LoggingError;
use bookstream::{LoaderError, StreamingError};

#[derive(Debug)]
pub enum CliError {
    Config(String),
    Logging(String),
    Runtime(String),
    Cache(String),
    Loader(String),
    /// A load failed; carries the kind-specific guidance.
    Load {
        message: String,
        guidance: &'static str,
    },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Logging(msg) => write!(f, "Logging setup failed: {}", msg),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            CliError::Cache(msg) => write!(f, "Cache error: {}", msg),
            CliError::Loader(msg) => write!(f, "{}", msg),
            CliError::Load { message, guidance } => write!(f, "{}\n  {}", message, guidance),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e.to_string())
    }
}

impl From<CacheError> for CliError {
    fn from(e: CacheError) -> Self {
        CliError::Cache(e.to_string())
    }
}

impl From<StreamingError> for CliError {
    fn from(e: StreamingError) -> Self {
        CliError::Load {
            message: e.to_string(),
            guidance: e.guidance(),
        }
    }
}

impl From<LoaderError> for CliError {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::Streaming(e) => e.into(),
            other => CliError::Loader(other.to_string()),
        }
    }
}
