use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use logsentinel::config::Config;

#[derive(Parser)]
#[command(
    name = "logsentinel",
    about = "Self-hosted log ingestion and error-burst incident detection daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + ingest flusher + detection timer)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// Run a single detection pass and exit
    Tick {
        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// List recent incidents
    Incidents {
        /// SQLite database path (overrides config)
        #[arg(long)]
        db: Option<String>,

        /// Maximum rows to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, db } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            if let Some(db) = db {
                cfg.server.db_path = db;
            }
            tracing::info!(bind = %cfg.server.bind, "Starting logsentinel daemon");
            logsentinel::serve(cfg).await?;
        }
        Commands::Tick { db } => {
            if let Some(db) = db {
                cfg.server.db_path = db;
            }
            let pool = logsentinel::storage::open_pool(&cfg.server.db_path)?;
            let engine =
                logsentinel::detect::engine::DetectionEngine::new(pool, cfg.detect.clone());
            engine.run_tick().await?;
            println!("Detection tick complete.");
        }
        Commands::Incidents { db, limit } => {
            if let Some(db) = db {
                cfg.server.db_path = db;
            }
            let pool = logsentinel::storage::open_pool(&cfg.server.db_path)?;
            let store = logsentinel::detect::incident::IncidentStore::new(pool);
            let incidents = store.list_recent(limit)?;

            if incidents.is_empty() {
                println!("No incidents found.");
            } else {
                println!(
                    "{:<36} | {:<8} | {:<12} | {:<19} | Title",
                    "ID", "Severity", "Status", "Created"
                );
                println!(
                    "{:-<36}-|-{:-<8}-|-{:-<12}-|-{:-<19}-|-{:-<40}",
                    "", "", "", "", ""
                );
                for incident in incidents {
                    println!(
                        "{:<36} | {:<8} | {:<12} | {:<19} | {}",
                        incident.id,
                        incident.severity.to_string(),
                        incident.status.to_string(),
                        incident.created_at.format("%Y-%m-%d %H:%M:%S"),
                        incident.title
                    );
                }
            }
        }
    }

    Ok(())
}
