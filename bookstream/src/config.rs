//! Configuration for the loaders and the cache.
//!
//! `BookstreamConfig` is the in-process configuration handed to
//! [`crate::loader::LoaderBuilder`]. `ConfigFile` is the INI file operators
//! edit (`~/.config/bookstream/config.ini`); it converts into a
//! `BookstreamConfig` with [`ConfigFile::to_config`].
//!
//! ```ini
//! [cache]
//! directory = /home/reader/.cache/bookstream
//! max_size = 500MB
//! max_entry_age_days = 7
//! quota = soft
//!
//! [epub]
//! reading_speed_wpm = 250
//! metadata_timeout_secs = 10
//!
//! [pdf]
//! structure_timeout_secs = 45
//!
//! [retry]
//! max_attempts = 3
//! backoff_ms = 1000
//!
//! [logging]
//! level = info
//! file = /home/reader/.cache/bookstream/bookstream.log
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::logging::LoggingConfig;
use crate::streaming::RetryPolicy;

// =============================================================================
// Cache defaults
// =============================================================================

/// Default cache quota (500 MB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 500 * 1024 * 1024;

/// Default maximum entry age (7 days).
pub const DEFAULT_MAX_ENTRY_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Entries larger than this are eviction candidates regardless of age (5 MB).
pub const DEFAULT_BIG_ENTRY_BYTES: u64 = 5 * 1024 * 1024;

/// Minimum interval between maintenance passes (24 hours).
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// EPUB defaults
// =============================================================================

/// Assumed reading speed before the reader reports one.
pub const DEFAULT_READING_SPEED_WPM: u32 = 250;

/// Chapters kept ahead of the reader at normal speed.
pub const DEFAULT_PRELOAD_DISTANCE: u32 = 3;

/// Chapters kept ahead of the reader once they read faster than the threshold.
pub const FAST_READER_PRELOAD_DISTANCE: u32 = 5;

/// Reading speed above which the fast-reader distance applies.
pub const FAST_READER_THRESHOLD_WPM: u32 = 300;

/// Hard deadline for the metadata pass.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached metadata older than this is re-extracted.
pub const DEFAULT_METADATA_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// PDF defaults
// =============================================================================

/// Hard deadline for loading the initial document structure.
pub const DEFAULT_STRUCTURE_TIMEOUT: Duration = Duration::from_secs(45);

/// Pages preloaded after the reported position.
pub const DEFAULT_PAGE_PREFETCH: u32 = 2;

// =============================================================================
// Retry / transport defaults
// =============================================================================

/// Retries spent on recoverable errors before surfacing them.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Linear backoff step: the n-th retry waits `n * step`.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Per-request timeout of the default HTTP transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens when eviction cannot free enough room for a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaPolicy {
    /// Store the entry anyway and log the overflow.
    #[default]
    Soft,
    /// Reject entries that cannot fit.
    Hard,
}

impl QuotaPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaPolicy::Soft => "soft",
            QuotaPolicy::Hard => "hard",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "soft" => Some(QuotaPolicy::Soft),
            "hard" => Some(QuotaPolicy::Hard),
            _ => None,
        }
    }
}

/// Cache store limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Quota across all entries, in bytes.
    pub max_cache_bytes: u64,
    /// Entries not accessed for this long are expired.
    pub max_entry_age: Duration,
    /// Entries larger than this are preferred for eviction.
    pub big_entry_bytes: u64,
    /// Minimum interval between maintenance passes.
    pub cleanup_interval: Duration,
    /// Overflow behaviour.
    pub quota: QuotaPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_entry_age: DEFAULT_MAX_ENTRY_AGE,
            big_entry_bytes: DEFAULT_BIG_ENTRY_BYTES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            quota: QuotaPolicy::Soft,
        }
    }
}

impl CacheConfig {
    /// Set the quota in bytes.
    pub fn with_max_bytes(mut self, max_cache_bytes: u64) -> Self {
        self.max_cache_bytes = max_cache_bytes;
        self
    }

    /// Set the maximum entry age.
    pub fn with_max_entry_age(mut self, max_entry_age: Duration) -> Self {
        self.max_entry_age = max_entry_age;
        self
    }

    /// Set the quota policy.
    pub fn with_quota(mut self, quota: QuotaPolicy) -> Self {
        self.quota = quota;
        self
    }
}

/// EPUB loader settings.
#[derive(Debug, Clone)]
pub struct EpubConfig {
    pub default_reading_speed_wpm: u32,
    pub preload_distance: u32,
    pub fast_preload_distance: u32,
    pub fast_reader_threshold_wpm: u32,
    pub metadata_timeout: Duration,
    pub metadata_freshness: Duration,
}

impl Default for EpubConfig {
    fn default() -> Self {
        Self {
            default_reading_speed_wpm: DEFAULT_READING_SPEED_WPM,
            preload_distance: DEFAULT_PRELOAD_DISTANCE,
            fast_preload_distance: FAST_READER_PRELOAD_DISTANCE,
            fast_reader_threshold_wpm: FAST_READER_THRESHOLD_WPM,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            metadata_freshness: DEFAULT_METADATA_FRESHNESS,
        }
    }
}

impl EpubConfig {
    /// Prefetch distance for a given reading speed.
    pub fn distance_for_speed(&self, reading_speed_wpm: u32) -> u32 {
        if reading_speed_wpm > self.fast_reader_threshold_wpm {
            self.fast_preload_distance
        } else {
            self.preload_distance
        }
    }
}

/// PDF loader settings.
#[derive(Debug, Clone)]
pub struct PdfConfig {
    pub structure_timeout: Duration,
    pub page_prefetch: u32,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            structure_timeout: DEFAULT_STRUCTURE_TIMEOUT,
            page_prefetch: DEFAULT_PAGE_PREFETCH,
        }
    }
}

/// Retry settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryConfig {
    /// Linear retry policy described by this config.
    pub fn policy(&self) -> RetryPolicy {
        if self.max_retries == 0 {
            RetryPolicy::None
        } else {
            RetryPolicy::linear(self.max_retries, self.backoff_step)
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: format!("bookstream/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Top-level configuration handed to the loader.
#[derive(Debug, Clone, Default)]
pub struct BookstreamConfig {
    pub cache: CacheConfig,
    pub epub: EpubConfig,
    pub pdf: PdfConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
}

impl BookstreamConfig {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_epub(mut self, epub: EpubConfig) -> Self {
        self.epub = epub;
        self
    }

    pub fn with_pdf(mut self, pdf: PdfConfig) -> Self {
        self.pdf = pdf;
        self
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Errors raised while reading or writing the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid value for [{section}] {key}: {value:?}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },

    #[error("invalid size: {0:?}")]
    InvalidSize(String),
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSection {
    pub directory: PathBuf,
    pub max_size: u64,
    pub max_entry_age_days: u64,
    pub quota: QuotaPolicy,
}

/// `[epub]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct EpubSection {
    pub reading_speed_wpm: u32,
    pub metadata_timeout_secs: u64,
}

/// `[pdf]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfSection {
    pub structure_timeout_secs: u64,
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSection {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Operator-facing configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFile {
    pub cache: CacheSection,
    pub epub: EpubSection,
    pub pdf: PdfSection,
    pub retry: RetrySection,
    pub logging: LoggingSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            cache: CacheSection {
                directory: default_cache_dir(),
                max_size: DEFAULT_MAX_CACHE_BYTES,
                max_entry_age_days: DEFAULT_MAX_ENTRY_AGE.as_secs() / 86_400,
                quota: QuotaPolicy::Soft,
            },
            epub: EpubSection {
                reading_speed_wpm: DEFAULT_READING_SPEED_WPM,
                metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT.as_secs(),
            },
            pdf: PdfSection {
                structure_timeout_secs: DEFAULT_STRUCTURE_TIMEOUT.as_secs(),
            },
            retry: RetrySection {
                max_attempts: DEFAULT_MAX_RETRIES,
                backoff_ms: DEFAULT_BACKOFF_STEP.as_millis() as u64,
            },
            logging: LoggingSection {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bookstream")
}

impl ConfigFile {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bookstream").join("config.ini"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path. Missing keys keep their defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut config = Self::default();

        if let Some(section) = ini.section(Some("cache")) {
            if let Some(dir) = section.get("directory") {
                config.cache.directory = PathBuf::from(dir.trim());
            }
            if let Some(size) = section.get("max_size") {
                config.cache.max_size = parse_size(size)?;
            }
            if let Some(days) = section.get("max_entry_age_days") {
                config.cache.max_entry_age_days = parse_number("cache", "max_entry_age_days", days)?;
            }
            if let Some(quota) = section.get("quota") {
                config.cache.quota =
                    QuotaPolicy::parse(quota).ok_or_else(|| ConfigError::InvalidValue {
                        section: "cache",
                        key: "quota",
                        value: quota.to_string(),
                    })?;
            }
        }

        if let Some(section) = ini.section(Some("epub")) {
            if let Some(wpm) = section.get("reading_speed_wpm") {
                config.epub.reading_speed_wpm = parse_number("epub", "reading_speed_wpm", wpm)?;
            }
            if let Some(secs) = section.get("metadata_timeout_secs") {
                config.epub.metadata_timeout_secs =
                    parse_number("epub", "metadata_timeout_secs", secs)?;
            }
        }

        if let Some(section) = ini.section(Some("pdf")) {
            if let Some(secs) = section.get("structure_timeout_secs") {
                config.pdf.structure_timeout_secs =
                    parse_number("pdf", "structure_timeout_secs", secs)?;
            }
        }

        if let Some(section) = ini.section(Some("retry")) {
            if let Some(attempts) = section.get("max_attempts") {
                config.retry.max_attempts = parse_number("retry", "max_attempts", attempts)?;
            }
            if let Some(ms) = section.get("backoff_ms") {
                config.retry.backoff_ms = parse_number("retry", "backoff_ms", ms)?;
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(level) = section.get("level") {
                config.logging.level = level.trim().to_string();
            }
            if let Some(file) = section.get("file") {
                let file = file.trim();
                config.logging.file = (!file.is_empty()).then(|| PathBuf::from(file));
            }
        }

        Ok(config)
    }

    /// Write the config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut ini = Ini::new();
        ini.with_section(Some("cache"))
            .set("directory", self.cache.directory.display().to_string())
            .set("max_size", format_size_setting(self.cache.max_size))
            .set("max_entry_age_days", self.cache.max_entry_age_days.to_string())
            .set("quota", self.cache.quota.as_str());
        ini.with_section(Some("epub"))
            .set("reading_speed_wpm", self.epub.reading_speed_wpm.to_string())
            .set(
                "metadata_timeout_secs",
                self.epub.metadata_timeout_secs.to_string(),
            );
        ini.with_section(Some("pdf")).set(
            "structure_timeout_secs",
            self.pdf.structure_timeout_secs.to_string(),
        );
        ini.with_section(Some("retry"))
            .set("max_attempts", self.retry.max_attempts.to_string())
            .set("backoff_ms", self.retry.backoff_ms.to_string());
        let mut logging = ini.with_section(Some("logging"));
        logging.set("level", self.logging.level.clone());
        if let Some(file) = &self.logging.file {
            logging.set("file", file.display().to_string());
        }

        ini.write_to_file(path).map_err(write_err)
    }

    /// Logging settings from the `[logging]` section.
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.logging.level.clone(),
            file: self.logging.file.clone(),
            ..LoggingConfig::default()
        }
    }

    /// Translate into the loader configuration.
    pub fn to_config(&self) -> BookstreamConfig {
        let cache = CacheConfig {
            max_cache_bytes: self.cache.max_size,
            max_entry_age: Duration::from_secs(self.cache.max_entry_age_days * 86_400),
            quota: self.cache.quota,
            ..CacheConfig::default()
        };
        let epub = EpubConfig {
            default_reading_speed_wpm: self.epub.reading_speed_wpm,
            metadata_timeout: Duration::from_secs(self.epub.metadata_timeout_secs),
            ..EpubConfig::default()
        };
        let pdf = PdfConfig {
            structure_timeout: Duration::from_secs(self.pdf.structure_timeout_secs),
            ..PdfConfig::default()
        };
        let retry = RetryConfig {
            max_retries: self.retry.max_attempts,
            backoff_step: Duration::from_millis(self.retry.backoff_ms),
        };

        BookstreamConfig {
            cache,
            epub,
            pdf,
            retry,
            transport: TransportConfig::default(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    section: &'static str,
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            section,
            key,
            value: value.to_string(),
        })
}

/// Parse a size such as `512`, `64KB`, `500MB` or `2GB` (binary units).
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim().to_uppercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(value.to_string()))?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return Err(ConfigError::InvalidSize(value.to_string())),
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(value.to_string()))
}

/// Format a size in bytes as a human-readable string.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Size in the largest unit that represents it exactly, for writing back.
fn format_size_setting(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1024 * 1024 * 1024, "GB"), (1024 * 1024, "MB"), (1024, "KB")];
    for (factor, suffix) in UNITS {
        if bytes >= factor && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size("500mb").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size(" 2 GB ").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12TB").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(64 * 1024), "64.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_size_setting_roundtrips_through_parse() {
        for bytes in [1000, 64 * 1024, 500 * 1024 * 1024, 3 * 1024 * 1024 * 1024] {
            assert_eq!(parse_size(&format_size_setting(bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn test_distance_for_speed() {
        let epub = EpubConfig::default();
        assert_eq!(epub.distance_for_speed(250), 3);
        assert_eq!(epub.distance_for_speed(300), 3);
        assert_eq!(epub.distance_for_speed(301), 5);
    }

    #[test]
    fn test_retry_config_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.policy().max_retries(), 3);

        let none = RetryConfig {
            max_retries: 0,
            backoff_step: Duration::from_millis(10),
        };
        assert_eq!(none.policy(), RetryPolicy::None);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.cache.directory = dir.path().join("cache");
        config.cache.max_size = 200 * 1024 * 1024;
        config.cache.quota = QuotaPolicy::Hard;
        config.epub.reading_speed_wpm = 320;
        config.logging.file = Some(dir.path().join("logs"));
        config.save_to(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_file_partial_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[cache]\nmax_size = 1MB\n").unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded.cache.max_size, 1024 * 1024);
        assert_eq!(loaded.epub, ConfigFile::default().epub);
    }

    #[test]
    fn test_config_file_rejects_bad_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[cache]\nquota = maybe\n").unwrap();

        let err = ConfigFile::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "quota", .. }));
    }

    #[test]
    fn test_to_config() {
        let mut file = ConfigFile::default();
        file.cache.max_size = 1_000_000;
        file.cache.max_entry_age_days = 2;
        file.retry.max_attempts = 5;
        file.retry.backoff_ms = 250;

        let config = file.to_config();
        assert_eq!(config.cache.max_cache_bytes, 1_000_000);
        assert_eq!(config.cache.max_entry_age, Duration::from_secs(2 * 86_400));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_step, Duration::from_millis(250));
        assert_eq!(config.cache.big_entry_bytes, DEFAULT_BIG_ENTRY_BYTES);
    }
}
