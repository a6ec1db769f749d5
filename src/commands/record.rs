use clap::{Args, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use std::io::{self, Write};

use statesync::config::Config;
use statesync::models::{format_timestamp, Record};
use statesync::sync::{Replica, SyncClient};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct RecordCommand {
    #[command(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    /// Show a record
    Get {
        /// Entity kind
        kind: String,

        /// Record ID
        id: String,

        /// Read from the local replica instead of the server
        #[arg(long)]
        local: bool,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List records of a kind from the local replica
    List {
        /// Entity kind
        kind: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Create or update a record
    ///
    /// Fields are merged onto the current payload. A version conflict is
    /// retried on top of the latest server copy.
    Put {
        /// Entity kind
        kind: String,

        /// Record ID (omit to let the server generate one)
        id: Option<String>,

        /// Set a field: key=value (value parsed as JSON, else string)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Fields as a JSON object
        #[arg(long)]
        json: Option<String>,
    },

    /// Delete a record
    Delete {
        /// Entity kind
        kind: String,

        /// Record ID
        id: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl RecordCommand {
    pub async fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let mut replica = Replica::load(&config.state_path)?;

        match &self.command {
            RecordSubcommand::Get {
                kind,
                id,
                local,
                format,
            } => {
                let record = if *local {
                    replica.get(kind, id).cloned()
                } else {
                    let client = SyncClient::from_config(config)?;
                    client.fetch(kind, id).await?
                };

                let record = match record {
                    Some(r) => r,
                    None => return Err(format!("Record not found: {}/{}", kind, id).into()),
                };

                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
                    OutputFormat::Text => print_record(&record)?,
                }
                Ok(())
            }

            RecordSubcommand::List { kind, format } => {
                let records: Vec<&Record> = replica
                    .entities
                    .get(kind)
                    .map(|m| m.values().collect())
                    .unwrap_or_default();

                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No {} records in the local replica.", kind);
                            return Ok(());
                        }
                        println!("{:<38} {:>8} {:<28}", "ID", "VERSION", "UPDATED");
                        println!("{}", "-".repeat(76));
                        for record in &records {
                            println!(
                                "{:<38} {:>8} {:<28}",
                                record.id,
                                record.version,
                                format_timestamp(&record.updated_at)
                            );
                        }
                        println!();
                        println!("Total: {} record(s)", records.len());
                    }
                }
                Ok(())
            }

            RecordSubcommand::Put { kind, id, set, json } => {
                let changes = build_changes(set, json.as_deref())?;
                if changes.is_empty() {
                    return Err("Nothing to write; use --set or --json".into());
                }

                let client = SyncClient::from_config(config)?;
                let record = match id {
                    Some(id) => client.put(&mut replica, kind, id, changes).await?,
                    None => client.create(&mut replica, kind, changes).await?,
                };
                replica.save(&config.state_path)?;

                println!("Saved {}/{} at version {}", record.kind, record.id, record.version);
                Ok(())
            }

            RecordSubcommand::Delete { kind, id, force } => {
                if !force {
                    print!("Delete {}/{}? [y/N] ", kind, id);
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Deletion cancelled.");
                        return Ok(());
                    }
                }

                let client = SyncClient::from_config(config)?;
                let record = client.delete(&mut replica, kind, id).await?;
                replica.save(&config.state_path)?;

                println!("Deleted {}/{} (version {})", record.kind, record.id, record.version);
                Ok(())
            }
        }
    }
}

fn print_record(record: &Record) -> Result<(), serde_json::Error> {
    println!("{}/{}", record.kind, record.id);
    println!("  version:    {}", record.version);
    println!("  updated_at: {}", format_timestamp(&record.updated_at));
    if let Some(deleted_at) = &record.deleted_at {
        println!("  deleted_at: {}", format_timestamp(deleted_at));
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&record.payload)?);
    Ok(())
}

/// Combines `--json` and `--set` arguments; `--set` wins on overlap.
fn build_changes(set: &[String], json: Option<&str>) -> Result<Map<String, Value>, String> {
    let mut changes = match json {
        Some(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("--json must be a JSON object".to_string()),
            Err(e) => return Err(format!("Invalid --json: {}", e)),
        },
        None => Map::new(),
    };

    for assignment in set {
        let (key, value) = parse_assignment(assignment)?;
        changes.insert(key, value);
    }

    Ok(changes)
}

fn parse_assignment(assignment: &str) -> Result<(String, Value), String> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", assignment))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Empty key in '{}'", assignment));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
