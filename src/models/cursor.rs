//! Change-feed cursors.
//!
//! A cursor remembers, per kind, the `(updated_at, id)` of the last row that
//! was delivered. Resuming from that pair with a tie-breaking comparison
//! means rows sharing a timestamp with the page boundary are never skipped.
//!
//! On the wire the cursor is an opaque base64url token. A bare RFC 3339
//! timestamp is also accepted and treated as a fresh `since`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::record::parse_timestamp;

/// Last delivered position within one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPosition {
    #[serde(rename = "t")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "i")]
    pub id: String,
}

/// Resumable position in the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCursor {
    /// Lower bound for kinds that have no recorded position yet.
    #[serde(rename = "s")]
    pub since: DateTime<Utc>,
    #[serde(rename = "p", default)]
    pub positions: BTreeMap<String, KindPosition>,
}

/// Errors decoding a cursor token.
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("cursor is neither a timestamp nor a valid token")]
    Malformed,
}

impl FeedCursor {
    /// Starts a cursor at `since` with no per-kind positions.
    pub fn from_since(since: DateTime<Utc>) -> Self {
        Self {
            since,
            positions: BTreeMap::new(),
        }
    }

    pub fn position(&self, kind: &str) -> Option<&KindPosition> {
        self.positions.get(kind)
    }

    /// Records the last delivered row for a kind.
    pub fn advance(&mut self, kind: &str, updated_at: DateTime<Utc>, id: &str) {
        self.positions.insert(
            kind.to_string(),
            KindPosition {
                updated_at,
                id: id.to_string(),
            },
        );
    }

    /// The furthest timestamp this cursor has reached across all kinds.
    pub fn high_water_mark(&self) -> DateTime<Utc> {
        self.positions
            .values()
            .map(|p| p.updated_at)
            .fold(self.since, |acc, t| acc.max(t))
    }

    /// Encodes the cursor as an opaque URL-safe token.
    pub fn encode(&self) -> String {
        // Plain strings and maps: serialization cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a token, or a bare RFC 3339 timestamp.
    pub fn decode(token: &str) -> Result<Self, CursorError> {
        let token = token.trim();
        if let Ok(since) = parse_timestamp(token) {
            return Ok(Self::from_since(since));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| CursorError::Malformed)?;
        serde_json::from_slice(&bytes).map_err(|_| CursorError::Malformed)
    }
}
