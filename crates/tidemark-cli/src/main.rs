mod commands;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tidemark_config::ConfigLoader;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tidemark", version, about = "Versioned, transactional schema migrations")]
struct Cli {
    /// Path to config file (YAML or TOML). Defaults to ~/.tidemark/config.yml
    #[arg(short, long, global = true, env = "TIDEMARK_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database to migrate; overrides the config file and TIDEMARK_DATABASE
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Apply all pending migrations
    Up,
    /// Roll back the most recently applied migration(s)
    Down {
        /// How many migrations to roll back
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// Show every registered migration and whether it is applied
    Status,
    /// List migrations that have not been applied yet
    Pending,
    /// Check that applied migrations left their tables, indexes and columns in place
    Verify,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config =
        ConfigLoader::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(database) = cli.database {
        config.database.path = Some(database);
    }

    let manager = Arc::new(commands::build_manager(&config)?);

    let cancel = manager.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current migration");
            cancel.cancel();
        }
    });

    let command = cli.command;
    let json = cli.json;
    tokio::task::spawn_blocking(move || {
        let mut out = std::io::stdout().lock();
        commands::execute(&manager, command, json, &mut out)
    })
    .await
    .context("migration task panicked")?
}
