//! StateSync Server
//!
//! Serves versioned, tenant-scoped records to sync clients: conditional
//! writes, an incremental change feed, snapshots and a realtime event stream.
//!
//! # Configuration
//!
//! Environment variables:
//! - `STATESYNC_CONFIG`: Path to config file (default: ~/.config/statesync-server/config.yaml)
//! - `STATESYNC_PORT`: Port to listen on (default: 8080)
//! - `STATESYNC_DATABASE_URL`: SQLite URL (default: sqlite:~/.local/share/statesync-server/statesync.db)
//!
//! See [`statesync::server::config`] for the config file format.

use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use statesync::db::init_db;
use statesync::server::{router, AppState, ServerConfig};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "statesync=info,statesync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = ServerConfig::default_config_path();
    tracing::info!("Config file: {}", config_path.display());

    let config = match ServerConfig::load(Some(config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let kinds = match config.registry() {
        Ok(kinds) => kinds,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Serving {} kind(s): {}", kinds.len(), kinds.names().join(", "));

    let pool = match init_db(&config.database_url, &kinds).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to open database {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Database: {}", config.database_url);

    let state = AppState::new(pool, kinds, &config);
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutting down"),
        Err(e) => {
            tracing::warn!("Cannot listen for shutdown signal: {}", e);
            std::future::pending::<()>().await
        }
    }
}
