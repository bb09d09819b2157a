use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use penny_storage::SqliteLedger;
use penny_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "penny", about = "Bank feed sync and deduplication for the Penny ledger.")]
struct Cli {
    /// Path to penny.toml (default: the platform config directory)
    #[arg(long, env = "PENNY_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Ledger database file, overriding `database_path` in the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull new activity for one or more bank connections.
    Sync {
        /// Connection ids, synced concurrently
        #[arg(required = true)]
        connections: Vec<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the saved feed position of a connection.
    Cursor { connection: String },
    /// Confirm a transaction's category and learn a rule from it.
    Confirm {
        transaction_id: i64,
        category_id: i64,
    },
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// Reclaim space in the ledger database.
    Vacuum,
}

#[derive(Subcommand)]
enum RulesCommands {
    /// List rules in the order they are applied.
    List,
    /// Upsert rules from a TOML file of `[[rules]]` tables.
    Import { file: PathBuf },
}

struct AppContext {
    ledger: Arc<SqliteLedger>,
    config: SyncConfig,
}

fn load_config(explicit: Option<&PathBuf>, dirs: &directories::ProjectDirs) -> Result<SyncConfig> {
    match explicit {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let path = dirs.config_dir().join("penny.toml");
            if path.exists() {
                SyncConfig::load(&path).with_context(|| format!("loading {}", path.display()))
            } else {
                Ok(SyncConfig::default())
            }
        }
    }
}

async fn open_context(cli: &Cli) -> Result<AppContext> {
    let dirs = directories::ProjectDirs::from("com", "penny", "Penny")
        .context("could not determine the home directory")?;
    let config = load_config(cli.config.as_ref(), &dirs)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let db_path = cli
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| dirs.data_dir().join("ledger.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let pool = penny_storage::create_db(&db_path)
        .await
        .with_context(|| format!("opening ledger at {}", db_path.display()))?;
    tracing::debug!(path = %db_path.display(), "ledger opened");

    Ok(AppContext {
        ledger: Arc::new(SqliteLedger::new(pool)),
        config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = open_context(&cli).await?;

    match cli.command {
        Commands::Sync { connections, json } => commands::sync(&ctx, connections, json).await,
        Commands::Cursor { connection } => commands::show_cursor(&ctx, &connection).await,
        Commands::Confirm { transaction_id, category_id } => {
            commands::confirm(&ctx, transaction_id, category_id).await
        }
        Commands::Rules { command: RulesCommands::List } => commands::list_rules(&ctx).await,
        Commands::Rules { command: RulesCommands::Import { file } } => {
            commands::import_rules(&ctx, &file).await
        }
        Commands::Vacuum => commands::vacuum(&ctx).await,
    }
}
