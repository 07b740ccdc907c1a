//! # Fetchpool - Parallel Media Fetching CLI
//!
//! Downloads media through a pool of isolated worker processes. Each worker
//! runs one task at a time; a worker that crashes is restarted and its task
//! reported as failed, so one bad download never stalls the rest.
//!
//! ## Features
//!
//! - **Process Isolation**: Every download runs in a separate worker process
//! - **Self-Healing**: Crashed workers are restarted under the same id
//! - **Live Progress**: Per-task progress bars fed by the workers
//! - **Cookie Fallback**: Failed downloads are retried with browser cookies when configured
//! - **Signal Handling**: Ctrl-C terminates the pool and settles every pending task
//!
//! ## Usage
//!
//! ```bash
//! # Download two videos with four workers
//! fetchpool fetch https://example.com/a https://example.com/b --workers 4
//!
//! # Download every URL listed in a file
//! fetchpool fetch --file urls.txt --output-dir ~/Music
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fetchpool::commands::{fetch::FetchCommand, worker::WorkerCommand};
use fetchpool::HandlerKind;

/// Fetchpool - A fault-tolerant parallel media fetcher
#[derive(Parser)]
#[command(
    name = "fetchpool",
    about = "A fault-tolerant parallel media fetcher",
    long_about = "Downloads media through a pool of isolated worker processes that survive individual crashes.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Download one or more URLs through the worker pool
    Fetch {
        /// URLs to download
        urls: Vec<String>,
        /// File with one URL per line
        #[arg(long, short = 'f')]
        file: Option<PathBuf>,
        /// Directory downloads are written to (defaults to current working directory)
        #[arg(long, short = 'o')]
        output_dir: Option<PathBuf>,
        /// Format selector passed to the downloader
        #[arg(long)]
        format: Option<String>,
        /// Number of worker processes
        #[arg(long, short = 'w', env = "FETCHPOOL_WORKERS")]
        workers: Option<usize>,
        /// Run downloads with low priority
        #[arg(long, short)]
        background: bool,
    },
    /// Serve tasks over stdin/stdout (started by the pool)
    #[command(hide = true)]
    Worker {
        /// Task handler to serve
        #[arg(long, value_enum, default_value = "fetch")]
        handler: HandlerKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing. Always on stderr: a worker's stdout carries the protocol.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fetchpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fetch {
            urls,
            file,
            output_dir,
            format,
            workers,
            background,
        } => match output_dir.map(Ok).unwrap_or_else(std::env::current_dir) {
            Ok(output_dir) => {
                info!(
                    "Starting fetch command for {} URLs, output: {:?}, workers: {:?}",
                    urls.len(),
                    output_dir,
                    workers
                );
                FetchCommand::new(urls, file, output_dir, format, workers, background)
                    .execute()
                    .await
            }
            Err(e) => Err(e.into()),
        },
        Commands::Worker { handler } => WorkerCommand::new(handler).execute().await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
