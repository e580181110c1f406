//! # Chatsync CLI
//!
//! The `chatsync` binary keeps a personal message archive synchronized into
//! a remote hybrid search index.
//!
//! ## Usage
//!
//! ```bash
//! chatsync --config ./config/chatsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chatsync init` | Create the SQLite state database and run migrations |
//! | `chatsync sync` | One-shot incremental sync of every conversation |
//! | `chatsync daemon` | Follow the live feed with periodic sweeps |
//! | `chatsync sweep` | Run one consistency sweep over the recent window |
//! | `chatsync purge` | Remove long-deleted messages from the index |
//! | `chatsync stats` | Summarize sync state and cache contents |
//! | `chatsync status` | Check database and index connectivity |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use chatsync::budget::BudgetTracker;
use chatsync::config::{self, Config};
use chatsync::embedder::{Embedder, HttpEmbeddingBackend};
use chatsync::feeder::{HttpIndexBackend, IndexFeeder};
use chatsync::models::Metrics;
use chatsync::pipeline::{Pipeline, SyncOptions};
use chatsync::source::JsonlSource;
use chatsync::state::StateStore;
use chatsync::{daemon, db, migrate, stats};

/// Chatsync — keep a message archive synchronized into a search index.
#[derive(Parser)]
#[command(
    name = "chatsync",
    about = "Sync a personal message archive into a remote hybrid search index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chatsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (sync_state, chunks, embedding_cache). Running it again is safe.
    Init,

    /// One-shot sync: process new events in every conversation and exit.
    ///
    /// Resumes from each conversation's saved cursor. Exits non-zero when
    /// any message failed and was deferred to the next run.
    Sync {
        /// Ignore saved cursors and re-walk full history.
        #[arg(long)]
        full: bool,

        /// Only process messages newer than this many days.
        #[arg(long)]
        days: Option<u32>,

        /// Maximum number of messages per conversation.
        #[arg(long)]
        limit: Option<usize>,

        /// Show message and chunk counts plus a cost estimate without
        /// embedding or feeding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run continuously: follow the live feed, sweep, and purge.
    Daemon,

    /// Run one consistency sweep over the recent window and exit.
    Sweep,

    /// Purge long-deleted messages from the index and exit.
    Purge,

    /// Summarize sync state, mirrored chunks, and the embedding cache.
    Stats,

    /// Check database and index connectivity.
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
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            full,
            days,
            limit,
            dry_run,
        } => {
            let (pipeline, source) = build_pipeline(&cfg).await?;
            let opts = SyncOptions {
                full,
                since_days: days,
                limit,
                dry_run,
            };
            let had_failures = pipeline.run_sync(&source, &opts).await?;
            if had_failures {
                std::process::exit(1);
            }
        }
        Commands::Daemon => {
            let (pipeline, source) = build_pipeline(&cfg).await?;
            daemon::run_daemon(Arc::new(pipeline), Arc::new(source)).await?;
        }
        Commands::Sweep => {
            let (pipeline, source) = build_pipeline(&cfg).await?;
            pipeline.sweep(&source).await?;
            println!("Sweep complete.");
        }
        Commands::Purge => {
            let (pipeline, _) = build_pipeline(&cfg).await?;
            let purged = pipeline.purge().await?;
            println!("Purged {} documents.", purged);
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Status => {
            run_status(&cfg).await?;
        }
    }

    Ok(())
}

/// Wire up the pipeline from config: database, HTTP backends, budget,
/// metrics, and the JSONL source.
async fn build_pipeline(cfg: &Config) -> anyhow::Result<(Pipeline, JsonlSource)> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = StateStore::new(pool);

    let metrics = Arc::new(Metrics::default());
    let budget = Arc::new(BudgetTracker::new(cfg.embedding.daily_budget_usd));

    let embedder = Embedder::new(
        Arc::new(HttpEmbeddingBackend::new(&cfg.embedding)?),
        store.clone(),
        &cfg.embedding,
        cfg.chunking.chunking_version,
        cfg.chunking.preprocess_version,
        budget,
        Arc::clone(&metrics),
    );

    let feeder = IndexFeeder::new(
        Arc::new(HttpIndexBackend::new(&cfg.index)?),
        &cfg.index,
        cfg.embedding.backoff_base_ms,
        cfg.embedding.backoff_max_ms,
        Arc::clone(&metrics),
    );

    let source = JsonlSource::new(&cfg.source);
    let pipeline = Pipeline::new(cfg.clone(), store, embedder, feeder, metrics);
    Ok((pipeline, source))
}

async fn run_status(cfg: &Config) -> anyhow::Result<()> {
    print!("Database ({}): ", cfg.db.path.display());
    match db::connect(&cfg.db.path).await {
        Ok(pool) => {
            println!("ok");
            pool.close().await;
        }
        Err(e) => println!("FAILED ({})", e),
    }

    print!("Index ({}): ", cfg.index.endpoint);
    let backend = HttpIndexBackend::new(&cfg.index)?;
    use chatsync::feeder::IndexBackend;
    if backend.health_check().await {
        println!("ok");
    } else {
        println!("FAILED");
    }

    print!("Source ({}): ", cfg.source.root.display());
    if cfg.source.root.is_dir() {
        println!("ok");
    } else {
        println!("FAILED (not a directory)");
    }

    Ok(())
}
