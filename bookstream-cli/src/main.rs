//! Bookstream CLI - open remote EPUB and PDF documents and manage the cache.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use commands::open::{KindArg, OpenArgs};
use error::CliError;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "bookstream", version, about = "Stream EPUB and PDF documents on demand")]
struct Cli {
    /// Config file (default: ~/.config/bookstream/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open a document and show loading progress
    Open {
        /// Document URL (an exploded EPUB base URL or a PDF file)
        url: String,

        /// Cache key (default: derived from the URL)
        #[arg(long)]
        key: Option<String>,

        /// Document format (default: from the URL extension)
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Fetch this chapter href once the book is open
        #[arg(long)]
        chapter: Option<String>,

        /// Resolve this page once the PDF is open
        #[arg(long)]
        page: Option<u32>,
    },

    /// Manage the local document cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = cli.config.as_deref();
    match cli.command {
        // Config commands work on the file itself and need no runtime.
        Commands::Config { command } => commands::config::run(command, config_path),
        Commands::Open {
            url,
            key,
            kind,
            chapter,
            page,
        } => {
            let runner = CliRunner::new(config_path, cli.verbose)?;
            commands::open::run(
                &runner,
                OpenArgs {
                    url,
                    key,
                    kind,
                    chapter,
                    page,
                },
            )
        }
        Commands::Cache { action } => {
            let runner = CliRunner::new(config_path, cli.verbose)?;
            commands::cache::run(&runner, action)
        }
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
