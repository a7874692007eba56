//! Shared setup for commands that touch the cache or the network.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bookstream::cache::CacheStore;
use bookstream::config::ConfigFile;
use bookstream::logging::{init_logging, LoggingGuard};
use tokio::runtime::Runtime;
use tracing::info;

use crate::error::CliError;

/// Loaded config, installed logging and a tokio runtime.
pub struct CliRunner {
    config: ConfigFile,
    config_path: Option<PathBuf>,
    runtime: Runtime,
    _logging: LoggingGuard,
}

impl CliRunner {
    pub fn new(config_path: Option<&Path>, verbose: u8) -> Result<Self, CliError> {
        let config = match config_path {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };

        let mut logging = config.logging_config();
        match verbose {
            0 => {}
            1 => logging.level = "debug".to_string(),
            _ => logging.level = "trace".to_string(),
        }
        let guard = init_logging(&logging)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| CliError::Runtime(e.to_string()))?;

        Ok(Self {
            config,
            config_path: config_path
                .map(Path::to_path_buf)
                .or_else(ConfigFile::default_path),
            runtime,
            _logging: guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            command,
            version = env!("CARGO_PKG_VERSION"),
            config = ?self.config_path,
            cache_dir = %self.config.cache.directory.display(),
            "bookstream starting"
        );
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Open the disk cache named in the config.
    pub async fn open_store(&self) -> Result<Arc<CacheStore>, CliError> {
        let config = self.config.to_config();
        let store = CacheStore::open_disk(&self.config.cache.directory, config.cache).await?;
        Ok(Arc::new(store))
    }
}
