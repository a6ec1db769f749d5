//! Tombstone retention.
//!
//! Tombstones are kept so deletions reach clients through the change feed.
//! Purging them is only safe for clients that have already pulled past the
//! purge point, so every purge records a per-tenant horizon and the feed
//! refuses cursors older than it; those clients reload from the snapshot.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::error::StoreResult;
use super::schema;
use crate::models::{format_timestamp, parse_timestamp, KindRegistry};

/// Outcome of a purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Rows removed per kind.
    pub purged: BTreeMap<String, u64>,
    /// Tenants whose horizon moved.
    pub tenants: BTreeSet<String>,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.purged.values().sum()
    }
}

pub struct TombstoneJanitor {
    pool: SqlitePool,
    kinds: Arc<KindRegistry>,
}

impl TombstoneJanitor {
    pub fn new(pool: SqlitePool, kinds: Arc<KindRegistry>) -> Self {
        Self { pool, kinds }
    }

    /// Physically deletes tombstones with `deleted_at < older_than`, for one
    /// tenant or all of them, and advances the affected tenants' horizons.
    pub async fn purge(
        &self,
        tenant_id: Option<&str>,
        older_than: DateTime<Utc>,
    ) -> StoreResult<PurgeReport> {
        let cutoff = format_timestamp(&older_than);
        let mut report = PurgeReport::default();
        let mut tx = super::begin_write(&self.pool).await?;

        for kind in self.kinds.iter() {
            let table = kind.table();

            let tenants: Result<Vec<(String,)>, sqlx::Error> = sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT tenant_id FROM {table}
                WHERE deleted_at IS NOT NULL AND deleted_at < ?1
                  AND (?2 IS NULL OR tenant_id = ?2)
                "#
            ))
            .bind(&cutoff)
            .bind(tenant_id)
            .fetch_all(&mut *tx)
            .await;

            let tenants = match tenants {
                Ok(tenants) => tenants,
                Err(err) if schema::classify(&err).is_some() => {
                    tracing::warn!("Skipping tombstone purge for kind {}: {}", kind.name, err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if tenants.is_empty() {
                continue;
            }

            let result = sqlx::query(&format!(
                r#"
                DELETE FROM {table}
                WHERE deleted_at IS NOT NULL AND deleted_at < ?1
                  AND (?2 IS NULL OR tenant_id = ?2)
                "#
            ))
            .bind(&cutoff)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

            report.purged.insert(kind.name.clone(), result.rows_affected());
            report.tenants.extend(tenants.into_iter().map(|(t,)| t));
        }

        for tenant in &report.tenants {
            sqlx::query(
                r#"
                INSERT INTO tombstone_horizons (tenant_id, purged_before) VALUES (?1, ?2)
                ON CONFLICT (tenant_id) DO UPDATE SET
                    purged_before = MAX(purged_before, excluded.purged_before)
                "#,
            )
            .bind(tenant)
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            "Purged {} tombstone(s) older than {} across {} tenant(s)",
            report.total(),
            cutoff,
            report.tenants.len()
        );

        Ok(report)
    }

    /// The tenant's purge horizon, if any tombstones were ever purged.
    pub async fn horizon(&self, tenant_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        load_horizon(&self.pool, tenant_id).await
    }
}

pub(crate) async fn load_horizon(
    pool: &SqlitePool,
    tenant_id: &str,
) -> StoreResult<Option<DateTime<Utc>>> {
    let row: Result<Option<(String,)>, sqlx::Error> =
        sqlx::query_as("SELECT purged_before FROM tombstone_horizons WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await;

    match row {
        Ok(Some((ts,))) => Ok(Some(parse_timestamp(&ts)?)),
        Ok(None) => Ok(None),
        Err(err) if schema::classify(&err).is_some() => Ok(None),
        Err(err) => Err(err.into()),
    }
}
