//! Server configuration.
//!
//! # Config File Format
//!
//! ```yaml
//! port: 8080
//! database_url: "sqlite:/var/lib/statesync/statesync.db"
//! api_keys:
//!   - key: "your-secret-key-here"
//!     tenant_id: "acme"
//!     user_id: "alice"
//! feed:
//!   default_limit: 500
//!   max_limit: 5000
//! # Optional; replaces the built-in kinds.
//! kinds:
//!   - name: invoice
//!     table: invoices
//!     heavy_fields: [pdf_blob]
//!     natural_key: number
//! ```
//!
//! Environment variables `STATESYNC_PORT` and `STATESYNC_DATABASE_URL`
//! override the file; `STATESYNC_CONFIG` points at the file.

use serde::Deserialize;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::db::{DEFAULT_CHUNK_LIMIT, DEFAULT_FEED_LIMIT, MAX_CHUNK_LIMIT, MAX_FEED_LIMIT};
use crate::fanout::DEFAULT_CHANNEL_CAPACITY;
use crate::models::{KindRegistry, KindSpec};

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for FeedLimits {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_FEED_LIMIT,
            max_limit: MAX_FEED_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotLimits {
    pub default_chunk: usize,
    pub max_chunk: usize,
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self {
            default_chunk: DEFAULT_CHUNK_LIMIT,
            max_chunk: MAX_CHUNK_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Events buffered per tenant before slow sockets are told to resync.
    pub channel_capacity: usize,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: String,
    pub api_keys: Vec<ApiKeyEntry>,
    /// Replaces the built-in kind registry when set.
    pub kinds: Option<Vec<KindSpec>>,
    pub feed: FeedLimits,
    pub snapshot: SnapshotLimits,
    pub realtime: RealtimeSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let db_path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("statesync-server")
            .join("statesync.db");

        Self {
            port: 8080,
            database_url: format!("sqlite:{}", db_path.display()),
            api_keys: Vec::new(),
            kinds: None,
            feed: FeedLimits::default(),
            snapshot: SnapshotLimits::default(),
            realtime: RealtimeSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
        }

        if let Some(port) = std::env::var("STATESYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.port = port;
        }
        if let Ok(url) = std::env::var("STATESYNC_DATABASE_URL") {
            config.database_url = url;
        }

        Ok(config)
    }

    /// `STATESYNC_CONFIG`, or ~/.config/statesync-server/config.yaml
    pub fn default_config_path() -> PathBuf {
        std::env::var("STATESYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("statesync-server")
                    .join("config.yaml")
            })
    }

    /// Builds the kind registry, falling back to the built-in kinds.
    pub fn registry(&self) -> Result<KindRegistry, ConfigError> {
        match &self.kinds {
            Some(kinds) => Ok(KindRegistry::new(kinds.clone())?),
            None => Ok(KindRegistry::default()),
        }
    }
}
