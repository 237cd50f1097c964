//! harbor command-line entry point.
//!
//! Wires the offline layer together once at startup and runs one subcommand.
//! Results go to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use harbor_core::AppConfig;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod commands;

use app::App;
use commands::{StatusFilter, build_request, parse_header};

#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(about = "Offline-tolerant HTTP client with a durable request queue")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (default: $HARBOR_CONFIG_FILE)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Treat the network as unreachable
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct HeaderArgs {
    /// Request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a URL, falling back to the cache
    Get {
        url: String,
        #[command(flatten)]
        headers: HeaderArgs,
    },
    /// Send a request, queueing it if the upstream is unreachable
    Send {
        method: String,
        url: String,
        /// Request body
        #[arg(short, long, conflicts_with = "body_file")]
        body: Option<String>,
        /// Read the request body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,
        #[command(flatten)]
        headers: HeaderArgs,
    },
    /// List queued requests
    Queue {
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// Replay pending requests now
    Drain,
    /// Delete a permanently failed request
    Dismiss { id: i64 },
    /// Move a failed request back to pending
    Requeue { id: i64 },
    /// Show connectivity, queue, breaker and cache state
    Status,
    /// Delete expired cache entries
    Purge {
        /// Delete every cache entry, not just expired ones
        #[arg(long)]
        all: bool,
        /// Also drop every queued request
        #[arg(long)]
        queue: bool,
    },
    /// Run the background sync loop until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(Some(path.as_path()))?,
        None => AppConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    // One-shot commands only live for a single check, so they publish
    // connectivity immediately.
    let debounce = if matches!(cli.command, Command::Run) { config.probe.debounce() } else { Duration::ZERO };
    let mut app = App::open(config, cli.offline, debounce).await?;

    match cli.command {
        Command::Get { url, headers } => {
            let request = build_request("GET", &url, headers.headers, None);
            print_json(&commands::request(&app, request).await?)
        }
        Command::Send { method, url, body, body_file, headers } => {
            let body = match (body, body_file) {
                (Some(body), _) => Some(body.into_bytes()),
                (None, Some(path)) => Some(
                    tokio::fs::read(&path).await.with_context(|| format!("failed to read {}", path.display()))?,
                ),
                (None, None) => None,
            };
            let request = build_request(&method, &url, headers.headers, body);
            print_json(&commands::request(&app, request).await?)
        }
        Command::Queue { status } => print_json(&commands::queue(&app, status).await?),
        Command::Drain => print_json(&commands::drain(&app).await?),
        Command::Dismiss { id } => print_json(&commands::dismiss(&app, id).await?),
        Command::Requeue { id } => print_json(&commands::requeue(&app, id).await?),
        Command::Status => print_json(&commands::status(&app).await?),
        Command::Purge { all, queue } => print_json(&commands::purge(&app, all, queue).await?),
        Command::Run => run(&mut app).await,
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Sync daemon: prints every state change as a JSON line.
async fn run(app: &mut App) -> Result<()> {
    let _states = app.controller.subscribe(|state| match serde_json::to_string(state) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize offline state"),
    });

    let liveness = app.spawn_liveness();
    let handle = app.controller.start();
    tracing::info!(db_path = %app.config.db_path.display(), "harbor sync running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    handle.stop().await;
    if let Some(task) = liveness {
        task.abort();
    }
    Ok(())
}
