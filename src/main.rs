//! # Memory index CLI (`memx`)
//!
//! ## Usage
//!
//! ```bash
//! memx --config ./memx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memx status` | Show index counts and feature availability |
//! | `memx sync` | Bring the index up to date |
//! | `memx search "<query>"` | Hybrid search over memory and transcripts |
//! | `memx read <path>` | Print a memory file or a line window of it |
//! | `memx probe` | Check the vector extension and embedding provider |
//! | `memx watch` | Keep the index synced until Ctrl-C |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use memory_index::config::{load_config, Config};
use memory_index::embedding::DefaultProviderFactory;
use memory_index::files::ReadFileRequest;
use memory_index::progress::ProgressMode;
use memory_index::{ManagerRegistry, MemoryIndexManager, SearchOptions, SyncOptions, SyncReason};

/// Local hybrid memory search over markdown notes and session transcripts.
#[derive(Parser)]
#[command(name = "memx", version)]
struct Cli {
    /// Path to configuration file (TOML). Defaults apply when it is missing.
    #[arg(long, global = true, default_value = "./memx.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show index status.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Sync the index with the workspace and transcripts.
    Sync {
        /// Rebuild the whole index through a safe reindex.
        #[arg(long)]
        force: bool,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Search indexed memory.
    Search {
        query: String,

        #[arg(long)]
        max_results: Option<usize>,

        #[arg(long)]
        min_score: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Read a memory file relative to the workspace.
    Read {
        path: String,

        /// First line to return (1-based).
        #[arg(long)]
        from: Option<usize>,

        /// Number of lines to return.
        #[arg(long)]
        lines: Option<usize>,
    },

    /// Check vector extension and embedding provider availability.
    Probe,

    /// Run with background sync until Ctrl-C.
    Watch,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(atty::is(atty::Stream::Stderr))
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn resolve_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        info!(path = %path.display(), "config file not found; using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = resolve_config(&cli.config)?;
    let factory = Arc::new(DefaultProviderFactory);

    match cli.command {
        Commands::Status { json } => {
            let manager = MemoryIndexManager::open(config, factory).await?;
            manager.probe_vector_availability().await;
            let status = manager.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", status.render());
            }
            manager.close().await;
        }
        Commands::Sync { force, progress } => {
            let manager = MemoryIndexManager::open(config, factory).await?;
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let options = SyncOptions::new(SyncReason::Manual)
                .force(force)
                .with_progress(mode.reporter());
            let result = manager.sync(options).await;
            if result.is_ok() {
                let status = manager.status().await?;
                println!("synced: {} files, {} chunks", status.files, status.chunks);
            }
            manager.close().await;
            result?;
        }
        Commands::Search {
            query,
            max_results,
            min_score,
            json,
        } => {
            let manager = MemoryIndexManager::open(config, factory).await?;
            if manager.is_dirty() {
                manager.sync(SyncOptions::new(SyncReason::Search)).await?;
            }
            let results = manager
                .search(
                    &query,
                    SearchOptions {
                        max_results,
                        min_score,
                        session_key: None,
                    },
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.3}] {}:{}-{} ({})",
                        i + 1,
                        r.score,
                        r.path,
                        r.start_line,
                        r.end_line,
                        r.source
                    );
                    for line in r.snippet.lines().take(4) {
                        println!("    {}", line);
                    }
                }
            }
            manager.close().await;
        }
        Commands::Read { path, from, lines } => {
            let manager = MemoryIndexManager::open(config, factory).await?;
            let result = manager.read_file(&ReadFileRequest {
                rel_path: path,
                from,
                lines,
            });
            manager.close().await;
            print!("{}", result?.text);
        }
        Commands::Probe => {
            let manager = MemoryIndexManager::open(config, factory).await?;
            let (vector, vector_error) = manager.probe_vector_availability().await;
            match vector_error {
                Some(err) if !vector => println!("vector:    unavailable ({})", err),
                _ => println!("vector:    {}", if vector { "available" } else { "disabled" }),
            }
            let embedding = manager.probe_embedding_availability().await;
            match &embedding {
                Ok(()) => println!("embedding: ok"),
                Err(e) => println!("embedding: failed ({:#})", e),
            }
            manager.close().await;
            embedding?;
        }
        Commands::Watch => {
            let registry = ManagerRegistry::new(factory);
            let manager = registry.get(config).await?;
            manager.sync(SyncOptions::new(SyncReason::Manual)).await?;
            info!(agent = manager.agent_id(), "watching for changes; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            registry.close_all().await;
        }
    }

    Ok(())
}
