use clap::{Args, Subcommand, ValueEnum};
use serde_json::json;

use statesync::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                let api_key = config.api_key.as_deref().map(mask);

                match format {
                    OutputFormat::Json => {
                        let value = json!({
                            "server_url": config.server_url,
                            "api_key": api_key,
                            "state_path": config.state_path,
                            "max_retries": config.max_retries,
                            "page_size": config.page_size,
                        });
                        println!("{}", serde_json::to_string_pretty(&value)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        let path = Config::default_config_path();
                        if path.exists() {
                            println!("Config file: {}", path.display());
                        } else {
                            println!("Config file: {} (not found)", path.display());
                        }
                        println!();

                        println!(
                            "server_url:  {}",
                            config.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!("api_key:     {}", api_key.as_deref().unwrap_or("(not set)"));
                        println!("state_path:  {}", config.state_path.display());
                        println!("max_retries: {}", config.max_retries);
                        println!("page_size:   {}", config.page_size);
                    }
                }
                Ok(())
            }
        }
    }
}

fn mask(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}****", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_hides_most_of_key() {
        assert_eq!(mask("sk_live_abcdef"), "sk_l****");
        assert_eq!(mask("ab"), "ab****");
    }
}
