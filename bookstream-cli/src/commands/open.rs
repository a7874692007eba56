//! `bookstream open`: load a document and render its progress.

use std::time::Duration;

use bookstream::config::format_size;
use bookstream::{DocumentHandle, DocumentKind, DocumentLoader, LoadEvent, LoaderBuilder};
use clap::ValueEnum;
use console::style;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Document format flag.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Epub,
    Pdf,
}

impl From<KindArg> for DocumentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Epub => DocumentKind::Epub,
            KindArg::Pdf => DocumentKind::Pdf,
        }
    }
}

/// Arguments of `bookstream open`.
#[derive(Debug)]
pub struct OpenArgs {
    pub url: String,
    pub key: Option<String>,
    pub kind: Option<KindArg>,
    pub chapter: Option<String>,
    pub page: Option<u32>,
}

/// Open the document, show progress until it is ready, then print a summary.
pub fn run(runner: &CliRunner, args: OpenArgs) -> Result<(), CliError> {
    runner.log_startup("open");
    let key = args.key.clone().unwrap_or_else(|| default_key(&args.url));

    runner.block_on(async {
        let store = runner.open_store().await?;
        if let Some(result) = store.maintain().await? {
            info!(%result, "Startup maintenance finished");
        }

        let loader = LoaderBuilder::new(store)
            .config(runner.config().to_config())
            .build()?;

        let (handle, mut events) =
            loader.open_document(&args.url, &key, args.kind.map(DocumentKind::from))?;
        println!(
            "{} {} as {}",
            style("Opening").bold(),
            args.url,
            style(handle).cyan()
        );

        let bar = progress_bar();
        let abort_loader = loader.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(%handle, "Interrupted, aborting load");
                abort_loader.abort(handle);
            }
        });

        let mut outcome = None;
        while let Some(event) = events.next().await {
            match event {
                LoadEvent::Progress(progress) => {
                    bar.set_position(progress.percentage.round() as u64);
                    bar.set_message(format!("{}: {}", progress.stage.as_str(), progress.message));
                }
                LoadEvent::Ready(handle) => {
                    outcome = Some(Ok(handle));
                    break;
                }
                LoadEvent::Failed(error) => {
                    outcome = Some(Err(error));
                    break;
                }
            }
        }
        ctrl_c.abort();

        match outcome {
            Some(Ok(handle)) => {
                bar.finish_with_message("ready");
                print_summary(&loader, handle)?;
                fetch_requested(&loader, handle, &args).await?;
                loader.abort(handle);
                Ok(())
            }
            Some(Err(error)) => {
                bar.abandon_with_message(style("failed").red().to_string());
                Err(error.into())
            }
            None => {
                bar.abandon_with_message(style("aborted").yellow().to_string());
                Err(bookstream::StreamingError::aborted().into())
            }
        }
    })
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn print_summary(loader: &DocumentLoader, handle: DocumentHandle) -> Result<(), CliError> {
    match handle.kind() {
        DocumentKind::Epub => {
            let metadata = loader.metadata(handle)?;
            let preloaded = loader.preloaded_chapters(handle)?;
            println!();
            println!("  Title:    {}", style(&metadata.title).bold());
            println!("  Author:   {}", metadata.author);
            println!("  Language: {}", metadata.language);
            println!("  Chapters: {}", metadata.chapter_count());
            println!("  Preloaded: {}", preloaded.join(", "));
        }
        DocumentKind::Pdf => {
            let info = loader.pdf_info(handle)?;
            println!();
            println!("  Pages:  {}", info.page_count);
            println!("  Size:   {}", format_size(info.total_bytes));
            println!("  Mode:   {:?}", info.mode);
            if let Some(chunk_bytes) = info.chunk_bytes {
                println!(
                    "  Chunks: {} of {} loaded",
                    loader.loaded_chunks(handle)?.len(),
                    info.total_bytes.div_ceil(chunk_bytes.max(1))
                );
            }
        }
    }
    Ok(())
}

async fn fetch_requested(
    loader: &DocumentLoader,
    handle: DocumentHandle,
    args: &OpenArgs,
) -> Result<(), CliError> {
    if let Some(href) = &args.chapter {
        let body = loader.get_chapter(handle, href).await?;
        println!(
            "  {} {} ({})",
            style("Chapter").green(),
            href,
            format_size(body.len() as u64)
        );
    }
    if let Some(number) = args.page {
        let page = loader.get_page(handle, number).await?;
        println!(
            "  {} {}: {}x{} pt, bytes {}..{}",
            style("Page").green(),
            page.number,
            page.width,
            page.height,
            page.offset,
            page.offset + page.length
        );
        let prefetched = loader.report_position(handle, number, None)?.wait().await;
        println!("  Prefetched {} following page(s)", prefetched);
    }
    Ok(())
}

/// Cache key from the last path segment of `url`, without extension.
fn default_key(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path);
    let stem = segment
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(segment);
    if stem.is_empty() {
        url.to_string()
    } else {
        stem.to_string()
    }
}
