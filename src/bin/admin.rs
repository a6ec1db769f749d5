//! StateSync Admin CLI
//!
//! Operator tool for the sync server's database.
//!
//! # Usage
//!
//! ```bash
//! statesync-admin kinds list
//! statesync-admin tombstones purge --older-than-days 90
//! statesync-admin tombstones purge --older-than-days 30 --tenant acme
//! statesync-admin tombstones horizon acme
//! ```
//!
//! Reads the same config file and environment variables as the server.

use chrono::Duration;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use statesync::db::{init_db, TombstoneJanitor};
use statesync::models::{format_timestamp, now, KindRegistry};
use statesync::server::ServerConfig;

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "statesync-admin")]
#[command(version)]
#[command(about = "StateSync server administration tool")]
struct Cli {
    /// Path to the server config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect entity kinds
    Kinds(KindsCommand),
    /// Manage soft-deleted records
    Tombstones(TombstonesCommand),
}

#[derive(Args)]
struct KindsCommand {
    #[command(subcommand)]
    command: KindsSubcommand,
}

#[derive(Subcommand)]
enum KindsSubcommand {
    /// List registered kinds and their tables
    List,
}

#[derive(Args)]
struct TombstonesCommand {
    #[command(subcommand)]
    command: TombstonesSubcommand,
}

#[derive(Subcommand)]
enum TombstonesSubcommand {
    /// Permanently delete old tombstones
    ///
    /// Clients whose cursor is older than the cutoff must reload a snapshot.
    Purge {
        /// Delete tombstones older than this many days
        #[arg(long)]
        older_than_days: u32,
        /// Only purge this tenant
        #[arg(long, short)]
        tenant: Option<String>,
    },
    /// Show a tenant's purge horizon
    Horizon {
        /// Tenant ID
        tenant: String,
    },
}

// ============================================================================
// Commands
// ============================================================================

fn list_kinds(kinds: &KindRegistry) {
    println!("{:<20} {:<24} {:<16} {:<24}", "KIND", "TABLE", "NATURAL KEY", "HEAVY FIELDS");
    println!("{}", "-".repeat(84));

    for kind in kinds.iter() {
        println!(
            "{:<20} {:<24} {:<16} {:<24}",
            kind.name,
            kind.table(),
            kind.natural_key.as_deref().unwrap_or("-"),
            if kind.heavy_fields.is_empty() {
                "-".to_string()
            } else {
                kind.heavy_fields.join(", ")
            }
        );
    }

    println!();
    println!("Total: {} kind(s)", kinds.len());
}

async fn purge(
    config: &ServerConfig,
    kinds: KindRegistry,
    older_than_days: u32,
    tenant: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_url, &kinds).await?;
    let janitor = TombstoneJanitor::new(pool, Arc::new(kinds));

    let cutoff = now() - Duration::days(i64::from(older_than_days));
    let report = janitor.purge(tenant.as_deref(), cutoff).await?;

    println!("Cutoff: {}", format_timestamp(&cutoff));
    if report.total() == 0 {
        println!("No tombstones to purge.");
        return Ok(());
    }

    for (kind, count) in &report.purged {
        println!("  {:<20} {}", kind, count);
    }
    println!();
    println!(
        "Purged {} tombstone(s) for {} tenant(s).",
        report.total(),
        report.tenants.len()
    );

    Ok(())
}

async fn show_horizon(
    config: &ServerConfig,
    kinds: KindRegistry,
    tenant: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_url, &kinds).await?;
    let janitor = TombstoneJanitor::new(pool, Arc::new(kinds));

    match janitor.horizon(&tenant).await? {
        Some(horizon) => println!("{}: {}", tenant, format_timestamp(&horizon)),
        None => println!("{}: no tombstones purged yet", tenant),
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statesync=warn".into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ServerConfig::load(cli.config)?;
    let kinds = config.registry()?;

    match cli.command {
        Commands::Kinds(cmd) => match cmd.command {
            KindsSubcommand::List => list_kinds(&kinds),
        },
        Commands::Tombstones(cmd) => match cmd.command {
            TombstonesSubcommand::Purge {
                older_than_days,
                tenant,
            } => purge(&config, kinds, older_than_days, tenant).await?,
            TombstonesSubcommand::Horizon { tenant } => {
                show_horizon(&config, kinds, tenant).await?
            }
        },
    }

    Ok(())
}
