//! # Codebase Index MCP CLI (`cim`)
//!
//! The `cim` binary starts the MCP server and inspects the local indexing
//! snapshot.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cim serve` | Start the MCP-compatible HTTP server |
//! | `cim status` | Print the snapshot's per-codebase indexing state |
//!
//! ## Configuration
//!
//! All settings come from environment variables:
//!
//! ```bash
//! export EMBEDDING_PROVIDER=openai      # or: gateway
//! export EMBEDDING_API_KEY=sk-...
//! export STORE_ADDRESS=https://...
//! export REPOS_BASE_PATH=/srv/repos
//! export DEFAULT_PROJECT=myproject
//! export DEFAULT_BRANCH=prod
//! cim serve
//! ```

use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::warn;

use codebase_index_mcp::config::McpConfig;
use codebase_index_mcp::snapshot::{CodebaseRecord, SnapshotStore};
use codebase_index_mcp::tuning::snapshot_save_interval;
use codebase_index_mcp::{engine::IndexResultStatus, server};

/// Codebase Index MCP: background semantic indexing and search for
/// checked-out codebases, exposed as MCP tools.
#[derive(Parser)]
#[command(
    name = "cim",
    about = "MCP server for semantic codebase indexing and search",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP-compatible HTTP server.
    ///
    /// Binds to MCP_HTTP_HOST:MCP_HTTP_PORT (default localhost:3000) and
    /// serves the tool surface at `POST /mcp`. The indexing snapshot is
    /// loaded at startup, saved periodically while dirty, and saved a
    /// final time on shutdown.
    Serve,

    /// Print the snapshot's per-codebase indexing state.
    ///
    /// Reads the snapshot file directly; does not contact the vector
    /// store, so the output reflects the last persisted state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(McpConfig::from_env()?);

    match cli.command {
        Commands::Serve => {
            let store = Arc::new(Mutex::new(SnapshotStore::load(&config.snapshot_path)));
            spawn_periodic_save(Arc::clone(&store), snapshot_save_interval(config.environment));
            server::run_server(config, store).await?;
        }
        Commands::Status => {
            let store = SnapshotStore::load(&config.snapshot_path);
            print_status(&config, &store);
        }
    }

    Ok(())
}

/// Background task that flushes unsaved snapshot mutations on a timer.
fn spawn_periodic_save(store: Arc<Mutex<SnapshotStore>>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut store = store.lock().expect("snapshot lock poisoned");
            if let Err(e) = store.save() {
                warn!(error = %e, "periodic snapshot save failed");
            }
        }
    });
}

/// Human-readable snapshot summary for `cim status`.
fn print_status(config: &McpConfig, store: &SnapshotStore) {
    println!("Snapshot: {}", store.path().display());
    println!("Repos base: {}", config.repos_base_path.display());
    println!();

    let records = store.all();
    if records.is_empty() {
        println!("No codebases are currently indexed or being indexed.");
        return;
    }

    println!("Codebases ({}):", records.len());
    for (path, record) in records {
        match record {
            CodebaseRecord::Indexed {
                indexed_files,
                total_chunks,
                index_status,
                last_updated,
            } => {
                let suffix = match index_status {
                    IndexResultStatus::Completed => "",
                    IndexResultStatus::LimitReached => " [partial: chunk limit]",
                };
                println!(
                    "  {}  indexed  {} files, {} chunks{}  ({})",
                    path, indexed_files, total_chunks, suffix, last_updated
                );
            }
            CodebaseRecord::Indexing {
                indexing_percentage,
                last_updated,
            } => {
                println!(
                    "  {}  indexing  {:.0}%  ({})",
                    path, indexing_percentage, last_updated
                );
            }
            CodebaseRecord::IndexFailed {
                error_message,
                last_attempted_percentage,
                last_updated,
            } => {
                let at = last_attempted_percentage
                    .map(|p| format!(" at {:.0}%", p))
                    .unwrap_or_default();
                println!(
                    "  {}  failed{}: {}  ({})",
                    path, at, error_message, last_updated
                );
            }
        }
    }
}
