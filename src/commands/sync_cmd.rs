//! Sync CLI commands for keeping the local replica current.

use clap::{Args, Subcommand};

use statesync::config::Config;
use statesync::models::{format_timestamp, EventType};
use statesync::sync::{Replica, ReplicaError, SyncClient, SyncClientError};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Discard the replica and load a fresh snapshot
    Snapshot,
    /// Stay connected and apply changes as they happen
    Watch,
    /// Show sync configuration, replica and server status
    Status,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            None => self.pull(config).await,
            Some(SyncSubcommand::Snapshot) => self.snapshot(config).await,
            Some(SyncSubcommand::Watch) => self.watch(config).await,
            Some(SyncSubcommand::Status) => self.status(config).await,
        }
    }

    async fn pull(&self, config: &Config) -> Result<(), SyncCommandError> {
        let client = SyncClient::from_config(config)?;
        let mut replica = Replica::load(&config.state_path)?;

        println!("Syncing with server...");
        let summary = client.pull(&mut replica).await?;
        replica.save(&config.state_path)?;

        println!();
        if summary.reloaded {
            println!(
                "  ✓ loaded snapshot: {} record(s) in {} page(s)",
                summary.updated, summary.pages
            );
        } else if summary.updated == 0 && summary.removed == 0 {
            println!("Already up to date.");
        } else {
            println!("  ✓ {} updated", summary.updated);
            println!("  ✓ {} removed", summary.removed);
            println!();
            println!("Sync complete.");
        }

        Ok(())
    }

    async fn snapshot(&self, config: &Config) -> Result<(), SyncCommandError> {
        let client = SyncClient::from_config(config)?;
        let mut replica = Replica::load(&config.state_path)?;

        println!("Loading snapshot...");
        let summary = client.snapshot(&mut replica).await?;
        replica.save(&config.state_path)?;

        println!(
            "  ✓ {} record(s) in {} page(s)",
            summary.records, summary.pages
        );
        Ok(())
    }

    async fn watch(&self, config: &Config) -> Result<(), SyncCommandError> {
        let client = SyncClient::from_config(config)?;
        let mut replica = Replica::load(&config.state_path)?;
        let state_path = config.state_path.clone();

        println!("Watching for changes (Ctrl-C to stop)...");

        let watching = client.watch(&mut replica, |replica, event| {
            match (event.event_type, event.record()) {
                (EventType::Resync, _) => println!("  ↻ resynced"),
                (EventType::RecordUpserted, Some(r)) => {
                    println!("  ✓ {}/{} v{}", r.kind, r.id, r.version)
                }
                (EventType::RecordDeleted, Some(r)) => {
                    println!("  ✗ {}/{} v{}", r.kind, r.id, r.version)
                }
                _ => {}
            }
            if let Err(e) = replica.save(&state_path) {
                tracing::warn!("Failed to save replica: {}", e);
            }
        });

        tokio::select! {
            result = watching => result?,
            _ = tokio::signal::ctrl_c() => println!(),
        }

        // Persist whatever was applied before stopping.
        replica.save(&config.state_path)?;
        println!("Stopped.");
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        if !config.is_configured() {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  server_url: \"http://localhost:8080\"");
            println!("  api_key: \"your-api-key\"");
            println!();
            println!("Or set environment variables:");
            println!("  STATESYNC_SERVER_URL");
            println!("  STATESYNC_API_KEY");
            return Ok(());
        }

        let server_url = config.server_url.as_deref().unwrap_or_default();
        let api_key = config.api_key.as_deref().unwrap_or_default();

        println!("Server:    {}", server_url);
        println!("API Key:   {}...", api_key.chars().take(8).collect::<String>());
        println!("Replica:   {}", config.state_path.display());
        println!();

        let replica = Replica::load(&config.state_path)?;
        println!("Local records: {}", replica.len());
        for (kind, records) in &replica.entities {
            println!("  {:<20} {}", kind, records.len());
        }
        match replica.snapshot_at {
            Some(at) => println!("Last snapshot: {}", format_timestamp(&at)),
            None => println!("Last snapshot: never"),
        }
        println!();

        print!("Server status: ");
        let client = SyncClient::from_config(config)?;
        match client.whoami().await {
            Ok(identity) => println!("✓ connected as {} (tenant {})", identity.user_id, identity.tenant_id),
            Err(SyncClientError::Http(_)) => println!("✗ unreachable"),
            Err(e) => println!("✗ error: {}", e),
        }

        Ok(())
    }
}

/// Errors from sync commands
#[derive(Debug, thiserror::Error)]
pub enum SyncCommandError {
    #[error(transparent)]
    Sync(#[from] SyncClientError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}
