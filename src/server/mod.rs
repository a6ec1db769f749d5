//! HTTP and WebSocket surface of the sync server.

pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod routes;

pub use auth::{ApiKeyStore, TenantContext};
pub use config::{ApiKeyEntry, ServerConfig};
pub use error::{ApiError, ApiResult};
pub use routes::{router, AppState, ChangesResponse, ChunkResponse};
