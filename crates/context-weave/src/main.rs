//! # context-weave CLI (`cw`)
//!
//! ## Usage
//!
//! ```bash
//! cw --config ./config/cw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cw init` | Create the SQLite database and run schema migrations |
//! | `cw index` | Incrementally index configured roots |
//! | `cw status` | Show index counts and the last run |
//! | `cw search "<query>"` | Search the index and every connector |
//! | `cw embed pending` | Embed chunks written keyword-only |
//! | `cw sources` | List index roots and connectors |
//! | `cw watch` | Re-index on file changes until interrupted |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_weave::commands::{self, SearchArgs};
use context_weave::{config, embed_cmd, migrate};

/// context-weave: incremental code/doc indexing, hybrid retrieval, and
/// cross-source federation.
#[derive(Parser)]
#[command(
    name = "cw",
    about = "context-weave: context retrieval across your code, docs, git history, and trackers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cw.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index configured roots. Only changed files are re-chunked.
    Index {
        /// Index a single root by name.
        #[arg(long)]
        root: Option<String>,

        /// Ignore the stored digest and rebuild from a full scan.
        #[arg(long)]
        full: bool,
    },

    /// Show index status.
    Status,

    /// Search the index and every configured connector.
    Search {
        query: String,

        /// File the caller is working in; boosts matching results.
        #[arg(long)]
        active_file: Option<String>,

        /// Current git branch; files it changed are boosted.
        #[arg(long)]
        branch: Option<String>,

        /// Base the branch is compared against.
        #[arg(long, default_value = "main")]
        base: String,

        /// Open ticket ID (repeatable); mentions are boosted.
        #[arg(long = "ticket")]
        tickets: Vec<String>,

        /// Session whose stored work context applies.
        #[arg(long)]
        session: Option<String>,

        /// Restrict to a source label or type (repeatable), e.g. `index`, `git_log:history`.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Only results under this path.
        #[arg(long)]
        path: Option<String>,

        /// Only `code` or `doc` chunks.
        #[arg(long)]
        kind: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// List index roots and connectors.
    Sources,

    /// Watch roots and re-index on change until Ctrl-C.
    Watch,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks written keyword-only while the provider was unavailable.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long, default_value_t = 1000)]
        limit: usize,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { root, full } => {
            commands::run_index(&cfg, root, full).await?;
        }
        Commands::Status => {
            commands::run_status(&cfg).await?;
        }
        Commands::Search {
            query,
            active_file,
            branch,
            base,
            tickets,
            session,
            sources,
            path,
            kind,
            limit,
            json,
        } => {
            let args = SearchArgs {
                query,
                active_file,
                branch,
                base,
                tickets,
                session,
                sources,
                path_prefix: path,
                kind,
                limit,
                json,
            };
            commands::run_search(&cfg, args).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
        },
        Commands::Sources => {
            commands::list_sources(&cfg)?;
        }
        Commands::Watch => {
            commands::run_watch(&cfg).await?;
        }
    }

    Ok(())
}
