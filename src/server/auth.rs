//! API-key authentication and tenant resolution.

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashMap;

use super::config::ApiKeyEntry;
use super::routes::AppState;

/// Authenticated caller, added to request extensions after auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
}

/// API key store - maps key -> TenantContext
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, TenantContext>,
}

impl ApiKeyStore {
    pub fn from_entries(entries: &[ApiKeyEntry]) -> Self {
        let keys: HashMap<String, TenantContext> = entries
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    TenantContext {
                        tenant_id: entry.tenant_id.clone(),
                        user_id: entry.user_id.clone(),
                    },
                )
            })
            .collect();

        if keys.is_empty() {
            tracing::warn!("No API keys loaded - all authenticated requests will fail");
        } else {
            tracing::info!("Loaded {} API key(s)", keys.len());
        }

        Self { keys }
    }

    /// Validate an API key and return the associated tenant
    pub fn validate(&self, key: &str) -> Option<TenantContext> {
        self.keys.get(key).cloned()
    }
}

/// Auth error response
#[derive(Serialize)]
struct AuthError {
    error: &'static str,
    message: &'static str,
}

fn unauthorized(error: &'static str, message: &'static str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(AuthError { error, message })).into_response()
}

/// Paths where the key may be passed as `?api_key=`. Browsers cannot set
/// headers on a WebSocket handshake.
const QUERY_KEY_PATHS: &[&str] = &["/realtime"];

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) => key.trim().to_string(),
            None => {
                return unauthorized(
                    "invalid_auth",
                    "Authorization header must use Bearer scheme",
                )
            }
        },
        None => match query_key(&request) {
            Some(key) => key,
            None => return unauthorized("missing_auth", "Authorization header required"),
        },
    };

    match state.api_keys.validate(&api_key) {
        Some(tenant) => {
            request.extensions_mut().insert(tenant);
            next.run(request).await
        }
        None => unauthorized("invalid_key", "Invalid API key"),
    }
}

fn query_key(request: &Request) -> Option<String> {
    if !QUERY_KEY_PATHS.contains(&request.uri().path()) {
        return None;
    }
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params.get("api_key").filter(|k| !k.is_empty()).cloned()
}
