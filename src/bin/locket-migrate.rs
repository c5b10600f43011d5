//! locket-migrate - apply and inspect locket schema migrations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use locket_migrate::config::Config;
use locket_migrate::definitions;
use locket_migrate::gateway::QueryGateway;
use locket_migrate::lock::LockMode;
use locket_migrate::readiness::wait_until_ready;
use locket_migrate::runner::{ChecksumPolicy, Migrator};
use locket_migrate::startup::{Initialization, Startup};
use locket_migrate::status::{ChecksumState, StatusReport, status};

/// Environment variable read by the log filter.
const LOG_ENV: &str = "LOCKET_LOG";

#[derive(Debug, Parser)]
#[command(name = "locket-migrate", version)]
#[command(about = "Schema migrations for the locket database")]
struct Cli {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Config file (default: <config dir>/locket/migrate.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serialize concurrent runs with a PostgreSQL advisory lock.
    #[arg(long, value_enum, global = true)]
    lock: Option<LockMode>,

    /// What to do when an applied migration was edited afterwards.
    #[arg(long, value_enum, global = true)]
    checksum_policy: Option<ChecksumPolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for the database, then apply pending migrations.
    Up,
    /// Show every migration and whether it ran.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List pending migrations and their SQL without executing them.
    Plan,
    /// Wait until the database accepts queries.
    Wait {
        /// Override the configured number of polls.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let gateway = QueryGateway::connect_lazy(config.database_url()?, &config.pool, config.retry)
        .context("failed to configure the database pool")?;

    let result = match cli.command {
        Command::Up => migrate_up(&gateway, &config).await,
        Command::Status { json } => migrate_status(&gateway, &config, json).await,
        Command::Plan => migrate_plan(&gateway, &config).await,
        Command::Wait { max_attempts } => wait(&gateway, &config, max_attempts).await,
    };

    gateway.close().await;
    result
}

/// Logs go to stderr so `status --json` stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(lock) = cli.lock {
        config.migrations.lock = lock;
    }
    if let Some(policy) = cli.checksum_policy {
        config.migrations.checksum_policy = policy;
    }
    Ok(config)
}

async fn migrate_up(gateway: &QueryGateway, config: &Config) -> Result<()> {
    println!("{}", "🚀 Applying migrations".cyan().bold());
    println!();

    let startup = Startup::new(gateway.clone(), definitions::all())
        .with_readiness(config.readiness)
        .with_migrations(config.migrations.clone());

    let report = match startup.initialize().await? {
        Initialization::Performed(report) => report,
        Initialization::AlreadyInitialized => return Ok(()),
    };

    for name in &report.skipped {
        println!("  {} {}", "○".dimmed(), name.dimmed());
    }
    for name in &report.applied {
        println!("  {} {}", "✓".green(), name);
    }
    println!();

    if report.is_noop() {
        println!("{}", "✓ Database is up to date".green());
    } else {
        println!(
            "{}",
            format!("✓ Applied {} migration(s)", report.applied.len())
                .green()
                .bold()
        );
    }
    Ok(())
}

async fn migrate_status(gateway: &QueryGateway, config: &Config, json: bool) -> Result<()> {
    let definitions = definitions::all();
    let report = status(gateway, &definitions, &config.migrations.ledger_table).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_status(&report, config);
    Ok(())
}

fn print_status(report: &StatusReport, config: &Config) {
    println!("{}", "📋 Migration Status".cyan().bold());
    println!();
    println!("  Migration table: {}", config.migrations.ledger_table.as_str().green());
    println!();

    for migration in &report.migrations {
        let executed = migration
            .executed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();

        match &migration.checksum {
            ChecksumState::Pending => {
                println!("  {} {:<40} {}", "○".dimmed(), migration.name, "pending".yellow());
            }
            ChecksumState::Match => {
                println!("  {} {:<40} {}", "✓".green(), migration.name, executed.dimmed());
            }
            ChecksumState::Unrecorded => {
                println!(
                    "  {} {:<40} {} {}",
                    "✓".green(),
                    migration.name,
                    executed.dimmed(),
                    "(no checksum)".dimmed()
                );
            }
            ChecksumState::Mismatch { .. } => {
                println!(
                    "  {} {:<40} {} {}",
                    "!".red().bold(),
                    migration.name,
                    executed.dimmed(),
                    "edited after it was applied".red()
                );
            }
        }
    }

    if !report.orphans.is_empty() {
        println!();
        println!("  {}", "Recorded but unknown to this build:".yellow());
        for orphan in &report.orphans {
            println!("  {} {}", "?".yellow(), orphan.name);
        }
    }

    println!();
    let pending = report.migrations.len() - report.applied_count();
    if report.is_current() {
        println!("{}", "✓ Database is up to date".green());
    } else {
        println!(
            "  {} applied, {} pending. Run {} to apply.",
            report.applied_count(),
            pending.to_string().yellow(),
            "locket-migrate up".cyan()
        );
    }
}

async fn migrate_plan(gateway: &QueryGateway, config: &Config) -> Result<()> {
    println!("{}", "📋 Migration Plan (dry-run)".cyan().bold());
    println!();

    let definitions = definitions::all();
    let migrator = Migrator::new(gateway, &definitions, &config.migrations);
    let pending = migrator.plan().await?;

    if pending.is_empty() {
        println!("{}", "✓ No migrations needed - database is up to date".green());
        return Ok(());
    }

    for definition in &pending {
        println!(
            "┌─ {} ({} steps) ─────────────────────────────────┐",
            definition.name.green().bold(),
            definition.steps.len()
        );
        for (i, step) in definition.steps.iter().enumerate() {
            println!("│ {}. {}", i + 1, step.description);
            for line in step.rendered().lines() {
                println!("│    {}", line.cyan());
            }
        }
        println!("└──────────────────────────────────────────────────────────────┘");
        println!();
    }

    println!("  {} pending migration(s)", pending.len().to_string().yellow());
    Ok(())
}

async fn wait(gateway: &QueryGateway, config: &Config, max_attempts: Option<u32>) -> Result<()> {
    let mut readiness = config.readiness;
    if let Some(max_attempts) = max_attempts {
        readiness.max_attempts = max_attempts;
    }

    wait_until_ready(gateway, &readiness).await?;
    println!("{}", "✓ Database is ready".green());
    Ok(())
}
