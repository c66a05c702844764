//! Operator CLI for knowledge-store.
//!
//! Applies and inspects schema migrations and probes endpoint health.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use knowledge_store::models::MigrationState;
use knowledge_store::{Repository, StoreConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// knowledge-store - migrations and health checks for the knowledge store.
#[derive(Parser)]
#[command(name = "knowledge-store")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML configuration file with a `[store]` table.
    #[arg(short, long, global = true, env = "KSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "KSTORE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations.
    Migrate,

    /// Check applied migrations against their recorded checksums.
    Verify,

    /// Show the state of every known migration.
    Status,

    /// Clear a recorded migration failure so the next migrate retries it.
    Acknowledge {
        /// Version of the failed migration.
        version: String,
    },

    /// Probe the primary and every replica.
    Health,

    /// Show the effective configuration with secrets redacted.
    Config,
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_json) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn init_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let default = if verbose { "knowledge_store=debug" } else { "knowledge_store=info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()?;
    }
    Ok(())
}

/// Runs the selected command.
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = StoreConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(config = %config.describe(), "Configuration loaded");

    if matches!(cli.command, Commands::Config) {
        println!("{}", config.describe());
        return Ok(ExitCode::SUCCESS);
    }

    let repo = Repository::new(config).context("failed to create repository")?;
    match cli.command {
        Commands::Migrate => cmd_migrate(&repo, cli.json).await,
        Commands::Verify => cmd_verify(&repo, cli.json).await,
        Commands::Status => cmd_status(&repo, cli.json).await,
        Commands::Acknowledge { version } => cmd_acknowledge(&repo, &version, cli.json).await,
        Commands::Health => cmd_health(&repo, cli.json).await,
        Commands::Config => Ok(ExitCode::SUCCESS),
    }
}

async fn cmd_migrate(repo: &Repository, json: bool) -> anyhow::Result<ExitCode> {
    let applied = repo.migrate().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&applied)?);
    } else if applied.is_empty() {
        println!("Schema is up to date.");
    } else {
        for record in &applied {
            println!("applied {}  {}", record.version, record.description);
        }
        println!("{} migration(s) applied.", applied.len());
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_verify(repo: &Repository, json: bool) -> anyhow::Result<ExitCode> {
    let verified = repo.verify_migrations().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&verified)?);
    } else {
        println!("{} applied migration(s) match their checksums.", verified.len());
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(repo: &Repository, json: bool) -> anyhow::Result<ExitCode> {
    let statuses = repo.migration_status().await?;
    let pending = statuses
        .iter()
        .filter(|s| !matches!(s.state, MigrationState::Applied))
        .count();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        for s in &statuses {
            let applied_at = s
                .applied_at
                .map_or_else(String::new, |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
            let state = match &s.state {
                MigrationState::Pending => "pending",
                MigrationState::Applying => "applying",
                MigrationState::Applied => "applied",
                MigrationState::Failed(_) => "FAILED",
            };
            println!("{:<6} {state:<10} {applied_at:<20} {}", s.version, s.description);
            if let MigrationState::Failed(error) = &s.state {
                println!("       {error}");
            }
        }
        println!("{pending} pending.");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_acknowledge(repo: &Repository, version: &str, json: bool) -> anyhow::Result<ExitCode> {
    let cleared = repo.acknowledge_failure(version).await?;
    if json {
        println!("{}", serde_json::json!({ "version": version, "acknowledged": cleared }));
    } else if cleared {
        println!("Failure of {version} acknowledged. Run migrate to retry it.");
    } else {
        println!("No recorded failure for {version}.");
    }
    Ok(if cleared { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn cmd_health(repo: &Repository, json: bool) -> anyhow::Result<ExitCode> {
    let endpoints = repo.health().await;
    let healthy = endpoints.iter().all(|e| e.healthy);
    if json {
        println!("{}", serde_json::to_string_pretty(&endpoints)?);
    } else {
        for e in &endpoints {
            let state = if e.healthy { "ok" } else { "FAILED" };
            match &e.error {
                Some(error) => println!("{:<10} {state:<6} {}ms  {error}", e.role, e.latency_ms),
                None => println!("{:<10} {state:<6} {}ms", e.role, e.latency_ms),
            }
        }
    }
    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
