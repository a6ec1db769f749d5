//! Versioned records and the storage <-> wire mapping.
//!
//! Every entity kind shares the same row shape in storage (snake_case columns,
//! payload as JSON text) and the same shape on the wire (camelCase fields,
//! payload as a nested JSON object). The translation between the two lives
//! here and nowhere else.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server-owned record of some entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub tenant_id: String,
    pub kind: String,
    /// Incremented by exactly one on every successful mutation.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    /// Set when the record is tombstoned.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    /// Returns true if this record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Removes the given top-level fields from the payload.
    ///
    /// Non-object payloads are left untouched.
    pub fn strip_fields(&mut self, fields: &[String]) {
        if fields.is_empty() {
            return;
        }
        if let Value::Object(map) = &mut self.payload {
            for field in fields {
                map.remove(field);
            }
        }
    }
}

/// Current time, truncated to the precision stored in the database.
///
/// Truncation keeps an in-memory record equal to the one read back later.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Formats a timestamp for storage.
///
/// The format is fixed-width (microseconds, `Z` suffix) so lexical order in
/// SQL matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored or client-supplied RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RecordDecodeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecordDecodeError::Timestamp(s.to_string(), e))
}

/// Errors decoding a stored row.
#[derive(Debug, thiserror::Error)]
pub enum RecordDecodeError {
    #[error("invalid timestamp '{0}': {1}")]
    Timestamp(String, chrono::ParseError),
    #[error("invalid payload JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Storage shape of a record row.
#[derive(Debug, sqlx::FromRow)]
pub struct RecordRow {
    pub tenant_id: String,
    pub id: String,
    /// Legacy rows may carry no version; they count as version 1.
    pub version: Option<i64>,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub payload: Option<String>,
}

impl RecordRow {
    /// Maps a storage row into a record of the given kind.
    pub fn into_record(self, kind: &str) -> Result<Record, RecordDecodeError> {
        let payload = match self.payload.as_deref() {
            Some(text) if !text.is_empty() => serde_json::from_str(text)?,
            _ => Value::Object(Default::default()),
        };

        Ok(Record {
            id: self.id,
            tenant_id: self.tenant_id,
            kind: kind.to_string(),
            version: self.version.unwrap_or(1),
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            payload,
        })
    }
}
