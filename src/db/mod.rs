//! Relational storage for versioned records.
//!
//! Components receive a [`SqlitePool`] handle explicitly; nothing here keeps
//! process-wide state.

mod change_feed;
mod error;
pub mod schema;
mod record_store;
mod snapshot;
mod tombstones;

pub use change_feed::{ChangeFeed, FeedPage, PullRequest, DEFAULT_FEED_LIMIT, MAX_FEED_LIMIT};
pub use error::{StoreError, StoreResult};
pub use record_store::{UpsertRequest, Upserted, VersionedRecordStore};
pub use snapshot::{BulkSnapshot, ChunkPage, SnapshotLoader, DEFAULT_CHUNK_LIMIT, MAX_CHUNK_LIMIT};
pub use tombstones::{PurgeReport, TombstoneJanitor};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::models::KindRegistry;

/// Opens the connection pool and creates tables for every registered kind.
pub async fn init_db(database_url: &str, kinds: &KindRegistry) -> Result<SqlitePool, sqlx::Error> {
    // Ensure parent directory exists
    if let Some(path) = database_path(database_url) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    ensure_schema(&pool, kinds).await?;

    Ok(pool)
}

/// Creates any missing kind tables and bookkeeping tables.
pub async fn ensure_schema(pool: &SqlitePool, kinds: &KindRegistry) -> Result<(), sqlx::Error> {
    for kind in kinds.iter() {
        schema::ensure_kind_table(pool, kind).await?;
    }
    schema::ensure_horizon_table(pool).await?;

    tracing::debug!("Schema ready for {} kind(s)", kinds.len());
    Ok(())
}

/// Opens a transaction that takes the database write lock up front.
///
/// A deferred transaction that reads before it writes can fail with
/// `SQLITE_BUSY` when another writer commits in between; the busy timeout
/// does not cover that upgrade. Every read-then-write path starts here.
pub(crate) async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

/// Extracts the file path from a `sqlite:` URL, if it names a file.
fn database_path(database_url: &str) -> Option<&Path> {
    let rest = database_url.strip_prefix("sqlite:")?;
    let rest = rest.trim_start_matches("//");
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(Path::new(path))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("test.db").display());
    let pool = init_db(&url, &KindRegistry::default()).await.unwrap();
    (pool, dir)
}
