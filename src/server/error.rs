//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::db::StoreError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String, Option<Value>) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            ApiError::Store(err) => match err {
                StoreError::VersionConflict { current, .. } => (
                    StatusCode::CONFLICT,
                    "version_conflict",
                    err.to_string(),
                    Some(json!({
                        "serverVersion": current.version,
                        "current": current,
                    })),
                ),
                StoreError::DuplicateKey { .. } => {
                    (StatusCode::CONFLICT, "duplicate_key", err.to_string(), None)
                }
                StoreError::NotFound { .. } | StoreError::UnknownKind(_) => {
                    (StatusCode::NOT_FOUND, "not_found", err.to_string(), None)
                }
                StoreError::CursorExpired { horizon } => (
                    StatusCode::GONE,
                    "cursor_expired",
                    err.to_string(),
                    Some(json!({ "horizon": horizon })),
                ),
                StoreError::Invalid(_) => {
                    (StatusCode::BAD_REQUEST, "bad_request", err.to_string(), None)
                }
                StoreError::Decode(e) => {
                    tracing::error!("Corrupt row: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        "An internal error occurred".to_string(),
                        None,
                    )
                }
                StoreError::Database(e) => {
                    tracing::error!("Database error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "database_error",
                        "Database error".to_string(),
                        None,
                    )
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, extra) = self.parts();

        let mut body = json!({
            "error": error,
            "message": message,
        });
        if let (Some(Value::Object(extra)), Value::Object(map)) = (extra, &mut body) {
            map.extend(extra);
        }

        (status, Json(body)).into_response()
    }
}
