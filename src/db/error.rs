//! Storage errors.

use chrono::{DateTime, Utc};

use crate::models::{Record, RecordDecodeError};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's expected version does not match the stored one.
    /// Carries the record as currently stored; nothing was written.
    #[error(
        "version conflict on {kind}/{id}: expected {expected}, stored {}",
        .current.version
    )]
    VersionConflict {
        kind: String,
        id: String,
        expected: i64,
        current: Box<Record>,
    },

    #[error("{kind}/{id} not found")]
    NotFound { kind: String, id: String },

    #[error("unknown entity kind '{0}'")]
    UnknownKind(String),

    #[error("{kind} with {field} '{value}' already exists")]
    DuplicateKey {
        kind: String,
        field: String,
        value: String,
    },

    #[error("cursor predates the tombstone horizon {horizon}; reload the snapshot")]
    CursorExpired { horizon: DateTime<Utc> },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("corrupt row: {0}")]
    Decode(#[from] RecordDecodeError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
