use serde::Deserialize;
use std::path::PathBuf;

use crate::models::KindError;

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the sync server, e.g. `http://localhost:8080`
    pub server_url: Option<String>,
    /// API key identifying the tenant
    pub api_key: Option<String>,
    /// Where the local replica is persisted
    pub state_path: PathBuf,
    /// How many times a write is retried after a version conflict
    pub max_retries: u32,
    /// Page size for snapshot chunks and feed pulls
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            state_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("statesync")
                .join("replica.json"),
            max_retries: 3,
            page_size: 500,
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        if let Ok(url) = std::env::var("STATESYNC_SERVER_URL") {
            config.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("STATESYNC_API_KEY") {
            config.api_key = Some(key);
        }

        Ok(config)
    }

    /// Default config file path: ~/.config/statesync/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("statesync")
            .join("config.yaml")
    }

    /// Returns true if both server URL and API key are set.
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, serde_yaml::Error),
    #[error("Invalid kind registry: {0}")]
    InvalidKinds(#[from] KindError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.state_path.to_string_lossy().contains("replica.json"));
        assert_eq!(config.max_retries, 3);
        assert!(!config.is_configured());
    }

    #[test]
    fn test_load_no_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.page_size, 500);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: http://sync.example.com").unwrap();
        writeln!(file, "state_path: /tmp/replica.json").unwrap();
        writeln!(file, "max_retries: 5").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("http://sync.example.com"));
        assert_eq!(config.state_path, PathBuf::from("/tmp/replica.json"));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "api_key: fromfile").unwrap();

        std::env::set_var("STATESYNC_API_KEY", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("fromenv"));

        std::env::remove_var("STATESYNC_API_KEY");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
