//! Cache management CLI commands.

use bookstream::cache::EntryType;
use bookstream::config::format_size;
use clap::Subcommand;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,
    /// Remove every cached entry
    Clear,
    /// Purge expired entries and trim to the size limit
    Maintain {
        /// Run even if the last pass was less than a day ago
        #[arg(long)]
        force: bool,
    },
}

/// Run a cache subcommand.
pub fn run(runner: &CliRunner, action: CacheAction) -> Result<(), CliError> {
    runner.log_startup("cache");
    runner.block_on(async {
        let store = runner.open_store().await?;
        let cache_dir = &runner.config().cache.directory;

        match action {
            CacheAction::Stats => {
                let stats = store.stats().await;
                let limit = store.config().max_cache_bytes;
                println!("Cache: {}", cache_dir.display());
                println!("  Entries: {}", stats.entry_count);
                println!(
                    "  Size:    {} of {} ({:.1}%)",
                    format_size(stats.total_bytes),
                    format_size(limit),
                    stats.total_bytes as f64 * 100.0 / limit.max(1) as f64
                );
                for entry_type in EntryType::ALL {
                    let count = store.keys_by_type(entry_type).await.len();
                    println!("  {:<9} {}", format!("{}:", entry_type.as_str()), count);
                }
                match stats.last_cleanup_at {
                    Some(at) => println!("  Last maintenance: {}", at.format("%Y-%m-%d %H:%M UTC")),
                    None => println!("  Last maintenance: never"),
                }
                Ok(())
            }
            CacheAction::Clear => {
                let before = store.stats().await;
                store.clear().await?;
                println!(
                    "Cleared {} entries, freed {}",
                    before.entry_count,
                    format_size(before.total_bytes)
                );
                Ok(())
            }
            CacheAction::Maintain { force } => {
                let result = if force {
                    Some(store.force_maintain().await?)
                } else {
                    store.maintain().await?
                };
                match result {
                    Some(result) => println!(
                        "Removed {} entries, freed {} in {}ms",
                        result.entries_removed,
                        format_size(result.bytes_freed),
                        result.duration_ms
                    ),
                    None => println!("Maintenance ran less than a day ago; use --force to run now"),
                }
                Ok(())
            }
        }
    })
}
