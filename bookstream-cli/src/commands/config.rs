//! Configuration management CLI commands.
//!
//! Provides `config init`, `config show` and `config path`.

use std::path::{Path, PathBuf};

use bookstream::config::{format_size, ConfigFile};
use clap::Subcommand;

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Write a config file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show,

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, explicit: Option<&Path>) -> Result<(), CliError> {
    let path = resolve_path(explicit)?;
    match command {
        ConfigCommands::Init { force } => run_init(&path, force),
        ConfigCommands::Show => run_show(&path),
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, CliError> {
    explicit
        .map(Path::to_path_buf)
        .or_else(ConfigFile::default_path)
        .ok_or_else(|| CliError::Config("no config directory on this platform; use --config".into()))
}

fn run_init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; use --force to overwrite",
            path.display()
        )));
    }

    ConfigFile::default().save_to(path)?;
    println!("Configuration file: {}", path.display());
    println!();
    println!("Edit this file to customize bookstream settings.");
    Ok(())
}

fn run_show(path: &Path) -> Result<(), CliError> {
    let config = if path.exists() {
        ConfigFile::load_from(path)?
    } else {
        println!("# {} not found, showing defaults", path.display());
        ConfigFile::default()
    };

    println!("[cache]");
    println!("  directory = {}", config.cache.directory.display());
    println!("  max_size = {}", format_size(config.cache.max_size));
    println!("  max_entry_age_days = {}", config.cache.max_entry_age_days);
    println!("  quota = {}", config.cache.quota.as_str());
    println!();
    println!("[epub]");
    println!("  reading_speed_wpm = {}", config.epub.reading_speed_wpm);
    println!("  metadata_timeout_secs = {}", config.epub.metadata_timeout_secs);
    println!();
    println!("[pdf]");
    println!("  structure_timeout_secs = {}", config.pdf.structure_timeout_secs);
    println!();
    println!("[retry]");
    println!("  max_attempts = {}", config.retry.max_attempts);
    println!("  backoff_ms = {}", config.retry.backoff_ms);
    println!();
    println!("[logging]");
    println!("  level = {}", config.logging.level);
    match &config.logging.file {
        Some(file) => println!("  file = {}", file.display()),
        None => println!("  file = (not set)"),
    }
    Ok(())
}
