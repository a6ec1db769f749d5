//! Local replica of a tenant's records.
//!
//! Holds live records per kind plus the change-feed cursor, persisted as a
//! single JSON file. Records are applied by version: anything not newer than
//! what the replica already saw is ignored, so realtime events and feed
//! pages can arrive in either order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::Record;

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("Failed to access replica file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt replica file: {0}")]
    Json(#[from] serde_json::Error),
}

/// What [`Replica::apply`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Not newer than the local copy.
    Stale,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Replica {
    /// Opaque change-feed cursor.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub snapshot_at: Option<DateTime<Utc>>,
    /// Live records: kind -> id -> record.
    #[serde(default)]
    pub entities: BTreeMap<String, BTreeMap<String, Record>>,
    /// Last seen version of removed records: kind -> id -> version.
    #[serde(default)]
    removed: BTreeMap<String, BTreeMap<String, i64>>,
}

impl Replica {
    /// Loads the replica, or an empty one if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self, ReplicaError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes the replica atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ReplicaError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&Record> {
        self.entities.get(kind)?.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn known_version(&self, kind: &str, id: &str) -> Option<i64> {
        let live = self.get(kind, id).map(|r| r.version);
        let removed = self.removed.get(kind).and_then(|m| m.get(id)).copied();
        live.max(removed)
    }

    /// Applies one record from the server. Tombstones remove the local row.
    pub fn apply(&mut self, record: Record) -> Applied {
        let known = self.known_version(&record.kind, &record.id);
        if known.is_some_and(|v| v >= record.version) {
            return Applied::Stale;
        }

        if record.is_deleted() {
            if let Some(records) = self.entities.get_mut(&record.kind) {
                records.remove(&record.id);
            }
            self.removed
                .entry(record.kind)
                .or_default()
                .insert(record.id, record.version);
            return Applied::Removed;
        }

        if let Some(removed) = self.removed.get_mut(&record.kind) {
            removed.remove(&record.id);
        }
        let existed = self
            .entities
            .entry(record.kind.clone())
            .or_default()
            .insert(record.id.clone(), record)
            .is_some();

        if existed {
            Applied::Updated
        } else {
            Applied::Inserted
        }
    }

    /// Replaces all records with a fresh snapshot and resets the cursor.
    pub fn replace_all(
        &mut self,
        entities: BTreeMap<String, Vec<Record>>,
        cursor: String,
        snapshot_at: DateTime<Utc>,
    ) {
        self.entities = entities
            .into_iter()
            .map(|(kind, records)| {
                let records = records
                    .into_iter()
                    .filter(|r| !r.is_deleted())
                    .map(|r| (r.id.clone(), r))
                    .collect();
                (kind, records)
            })
            .collect();
        self.removed.clear();
        self.cursor = Some(cursor);
        self.snapshot_at = Some(snapshot_at);
    }
}
