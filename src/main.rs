//! # Shelf Search CLI (`shelf`)
//!
//! The `shelf` binary drives the chapter-search engine: database setup,
//! catalog import, embedding backfill, one-off searches, and the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf init` | Create the SQLite database and schema |
//! | `shelf import <file>` | Load a JSON library of books and chapters |
//! | `shelf embed pending` | Backfill missing or stale chapter embeddings |
//! | `shelf embed rebuild` | Delete and regenerate all embeddings |
//! | `shelf search "<query>"` | Run a search for a plan/subscriber |
//! | `shelf tiers` | Print the tier catalog |
//! | `shelf serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use shelf_search::{config, embed_cmd, ingest, migrate, search, server, tier};

/// Shelf Search — a tiered relevance search engine for business-book
/// chapters.
#[derive(Parser)]
#[command(
    name = "shelf",
    about = "Shelf Search — search business-book chapters by topic",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelf.toml")]
    config: PathBuf,

    /// Increase diagnostic verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (books,
    /// chapters, usage_counters). Idempotent — safe to run repeatedly.
    Init,

    /// Load a JSON library file of books with nested chapters.
    ///
    /// Idempotent: books and chapters are upserted by id. A chapter whose
    /// text changed loses its stored embedding.
    Import {
        /// Path to the library JSON file.
        file: PathBuf,

        /// Show book and chapter counts without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage chapter embedding vectors.
    ///
    /// Requires an embedding provider (e.g., OpenAI) to be configured.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search indexed chapters.
    Search {
        /// The search query string.
        query: String,

        /// Subscription plan to search under.
        #[arg(long, default_value = "free")]
        plan: String,

        /// Subscriber id for usage accounting.
        #[arg(long, default_value = "cli")]
        subscriber: String,

        /// Method override: `vector` or `lexical`. Must be permitted by
        /// the plan.
        #[arg(long)]
        method: Option<String>,

        /// Maximum number of books to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the tier catalog with limits and feature flags.
    Tiers,

    /// Start the HTTP API for the web frontend.
    Serve,
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chapters that are missing or have stale embeddings.
    Pending {
        /// Maximum number of chapters to embed in this run.
        #[arg(long)]
        limit: Option<i64>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    Rebuild,
}

fn init_tracing(verbose: u8) {
    let filter = if let Ok(env) = std::env::var("SHELF_LOG") {
        EnvFilter::new(env)
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file, dry_run } => {
            ingest::run_import(&cfg, &file, dry_run).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
            EmbedAction::Rebuild => {
                embed_cmd::run_embed_rebuild(&cfg).await?;
            }
        },
        Commands::Search {
            query,
            plan,
            subscriber,
            method,
            limit,
        } => {
            let method = match method.as_deref() {
                None => None,
                Some(name) => Some(tier::SearchMethod::parse(name).ok_or_else(|| {
                    anyhow::anyhow!("Unknown method: {}. Use vector or lexical.", name)
                })?),
            };
            search::run_search(&cfg, &query, &plan, &subscriber, method, limit).await?;
        }
        Commands::Tiers => {
            let catalog = tier::TierCatalog::with_overrides(&cfg.tiers);
            for plan in catalog.plans() {
                let limit = match plan.monthly_limit {
                    Some(n) => format!("{}/month", n),
                    None => "unlimited".to_string(),
                };
                let methods: Vec<&str> = plan
                    .methods
                    .iter()
                    .map(|m| match m {
                        tier::SearchMethod::Vector => "vector",
                        tier::SearchMethod::Lexical => "lexical",
                    })
                    .collect();
                let enrichment = plan
                    .enrichment
                    .map(|d| d.as_str())
                    .unwrap_or("none");
                println!(
                    "{:<14} {:<12} methods: {:<18} enrichment: {}",
                    plan.name,
                    limit,
                    methods.join(", "),
                    enrichment
                );
                for (feature, enabled) in &plan.features {
                    println!("    {} = {}", feature, enabled);
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
