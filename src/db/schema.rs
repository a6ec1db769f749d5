//! Table layout for entity kinds and schema-drift detection.
//!
//! Every kind table has the same columns:
//!
//! ```text
//! tenant_id   TEXT NOT NULL
//! id          TEXT NOT NULL
//! version     INTEGER            -- NULL on legacy rows, read as 1
//! updated_at  TEXT NOT NULL      -- fixed-width RFC 3339, UTC
//! deleted_at  TEXT               -- NULL = live
//! natural_key TEXT               -- unique per tenant when set
//! payload     TEXT NOT NULL      -- JSON object
//! PRIMARY KEY (tenant_id, id)
//! ```
//!
//! Older tenant databases may predate some columns. Readers use
//! [`classify`] to tell drift apart from real failures and retry with a
//! [`Projection`] built from the columns the table actually has.

use sqlx::SqlitePool;

use crate::models::KindSpec;

/// Columns selected when reading records.
pub const RECORD_COLUMNS: &str = "tenant_id, id, version, updated_at, deleted_at, payload";

/// Record columns a drifted table may lack; read as NULL when absent.
const OPTIONAL_COLUMNS: [&str; 3] = ["version", "deleted_at", "payload"];

/// What a reader selects from a kind table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub columns: String,
    /// Whether `deleted_at` exists, i.e. whether tombstones can be told apart.
    pub has_deleted_at: bool,
}

impl Projection {
    pub fn full() -> Self {
        Self {
            columns: RECORD_COLUMNS.to_string(),
            has_deleted_at: true,
        }
    }

    /// Builds the projection from the columns `table` actually has.
    pub async fn for_table(pool: &SqlitePool, table: &str) -> Result<Self, sqlx::Error> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
            .bind(table)
            .fetch_all(pool)
            .await?;
        let has = |column: &str| names.iter().any(|n| n.eq_ignore_ascii_case(column));

        let columns = ["tenant_id", "id", "version", "updated_at", "deleted_at", "payload"]
            .iter()
            .map(|column| {
                if OPTIONAL_COLUMNS.contains(column) && !has(column) {
                    format!("NULL AS {column}")
                } else {
                    column.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Self {
            columns,
            has_deleted_at: has("deleted_at"),
        })
    }

    /// SQL condition selecting live rows, empty when tombstones are unknown.
    pub fn live_filter(&self) -> &'static str {
        if self.has_deleted_at {
            "AND deleted_at IS NULL"
        } else {
            ""
        }
    }
}

/// Creates the table and indexes for a kind if they don't exist yet.
pub async fn ensure_kind_table(pool: &SqlitePool, kind: &KindSpec) -> Result<(), sqlx::Error> {
    let table = kind.table();

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            version INTEGER,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            natural_key TEXT,
            payload TEXT NOT NULL DEFAULT '{{}}',
            PRIMARY KEY (tenant_id, id)
        )
        "#
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_natural_key ON {table}(tenant_id, natural_key)"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_feed ON {table}(tenant_id, updated_at, id)"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Creates the per-tenant tombstone purge horizon table.
pub async fn ensure_horizon_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tombstone_horizons (
            tenant_id TEXT PRIMARY KEY,
            purged_before TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Kinds of schema drift a reader can recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDrift {
    /// The table exists but lacks a column the query referenced.
    MissingColumn(String),
    /// The table itself is missing.
    MissingTable(String),
}

/// Classifies a query error as schema drift, if it is one.
pub fn classify(err: &sqlx::Error) -> Option<SchemaDrift> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    let message = db.message();

    if let Some(rest) = message.strip_prefix("no such column: ") {
        return Some(SchemaDrift::MissingColumn(rest.trim().to_string()));
    }
    if let Some(rest) = message.strip_prefix("no such table: ") {
        return Some(SchemaDrift::MissingTable(rest.trim().to_string()));
    }
    None
}
