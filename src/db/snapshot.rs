//! Cold-start snapshots.
//!
//! Snapshots carry live rows only, with each kind's heavy payload fields
//! removed. Like the change feed, kinds load concurrently and a failing kind
//! degrades to an empty list.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::StoreResult;
use super::schema::{self, Projection, SchemaDrift};
use crate::models::{now, KindRegistry, KindSpec, Record, RecordRow};

pub const DEFAULT_CHUNK_LIMIT: usize = 200;
pub const MAX_CHUNK_LIMIT: usize = 2000;

/// Every live record of the selected kinds.
#[derive(Debug, Clone)]
pub struct BulkSnapshot {
    pub entities: BTreeMap<String, Vec<Record>>,
    /// Read start time. Changes after this are picked up by the feed.
    pub loaded_at: DateTime<Utc>,
}

/// One page of a chunked snapshot. Each kind pages independently.
#[derive(Debug, Clone)]
pub struct ChunkPage {
    pub entities: BTreeMap<String, Vec<Record>>,
    /// Live row count per kind.
    pub totals: BTreeMap<String, u64>,
    pub kind_has_more: BTreeMap<String, bool>,
    pub has_more: bool,
    pub next_offset: Option<usize>,
    pub limit: usize,
    pub offset: usize,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct Window {
    limit: usize,
    offset: usize,
}

#[derive(Clone)]
pub struct SnapshotLoader {
    pool: SqlitePool,
    kinds: Arc<KindRegistry>,
    default_chunk: usize,
    max_chunk: usize,
}

impl SnapshotLoader {
    pub fn new(pool: SqlitePool, kinds: Arc<KindRegistry>) -> Self {
        Self {
            pool,
            kinds,
            default_chunk: DEFAULT_CHUNK_LIMIT,
            max_chunk: MAX_CHUNK_LIMIT,
        }
    }

    pub fn with_limits(mut self, default_chunk: usize, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk.max(1);
        self.default_chunk = default_chunk.clamp(1, self.max_chunk);
        self
    }

    fn resolve<'a>(&'a self, kinds: Option<&[String]>) -> Vec<&'a KindSpec> {
        let (selected, unknown) = self.kinds.select(kinds);
        if !unknown.is_empty() {
            tracing::warn!("Skipping unknown kinds in snapshot: {}", unknown.join(", "));
        }
        selected
    }

    /// Loads every live record of the tenant, unpaginated.
    pub async fn load_bulk(
        &self,
        tenant_id: &str,
        kinds: Option<&[String]>,
    ) -> StoreResult<BulkSnapshot> {
        let loaded_at = now();
        let selected = self.resolve(kinds);

        let results = join_all(
            selected
                .iter()
                .map(|kind| self.load_kind(tenant_id, kind, None)),
        )
        .await;

        let entities: BTreeMap<String, Vec<Record>> = selected
            .iter()
            .zip(results)
            .map(|(kind, records)| (kind.name.clone(), records))
            .collect();

        tracing::debug!(
            "Bulk snapshot for tenant {}: {} record(s) across {} kind(s)",
            tenant_id,
            entities.values().map(Vec::len).sum::<usize>(),
            entities.len()
        );

        Ok(BulkSnapshot { entities, loaded_at })
    }

    /// Loads `limit` live records per kind starting at `offset`.
    pub async fn load_chunk(
        &self,
        tenant_id: &str,
        limit: Option<usize>,
        offset: usize,
        kinds: Option<&[String]>,
    ) -> StoreResult<ChunkPage> {
        let loaded_at = now();
        let limit = limit.unwrap_or(self.default_chunk).clamp(1, self.max_chunk);
        let window = Window { limit, offset };
        let selected = self.resolve(kinds);

        let results = join_all(selected.iter().map(|kind| async move {
            let (records, total) = tokio::join!(
                self.load_kind(tenant_id, kind, Some(window)),
                self.count_kind(tenant_id, kind)
            );
            (records, total)
        }))
        .await;

        let mut page = ChunkPage {
            entities: BTreeMap::new(),
            totals: BTreeMap::new(),
            kind_has_more: BTreeMap::new(),
            has_more: false,
            next_offset: None,
            limit,
            offset,
            loaded_at,
        };

        for (kind, (records, total)) in selected.iter().zip(results) {
            let more = (offset + records.len()) < total as usize;
            page.has_more |= more;
            page.kind_has_more.insert(kind.name.clone(), more);
            page.totals.insert(kind.name.clone(), total);
            page.entities.insert(kind.name.clone(), records);
        }
        if page.has_more {
            page.next_offset = Some(offset + limit);
        }

        Ok(page)
    }

    /// Loads one kind; degrades to an empty list on failure.
    async fn load_kind(&self, tenant_id: &str, kind: &KindSpec, window: Option<Window>) -> Vec<Record> {
        let rows = match self.query_rows(tenant_id, kind, window, &Projection::full()).await {
            Ok(rows) => Ok(rows),
            Err(err) => match schema::classify(&err) {
                Some(SchemaDrift::MissingColumn(column)) => {
                    tracing::debug!(
                        "Kind {} lacks column {}, retrying with the columns it has",
                        kind.name,
                        column
                    );
                    match Projection::for_table(&self.pool, kind.table()).await {
                        Ok(projection) => self.query_rows(tenant_id, kind, window, &projection).await,
                        Err(err) => Err(err),
                    }
                }
                _ => Err(err),
            },
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Snapshot degraded for kind {}: {}", kind.name, err);
                return Vec::new();
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_record(&kind.name) {
                Ok(mut record) => {
                    record.strip_fields(&kind.heavy_fields);
                    records.push(record);
                }
                Err(err) => {
                    tracing::warn!("Snapshot degraded for kind {}: {}", kind.name, err);
                    return Vec::new();
                }
            }
        }
        records
    }

    async fn query_rows(
        &self,
        tenant_id: &str,
        kind: &KindSpec,
        window: Option<Window>,
        projection: &Projection,
    ) -> Result<Vec<RecordRow>, sqlx::Error> {
        let table = kind.table();
        let columns = &projection.columns;
        let filter = projection.live_filter();
        let base = format!("SELECT {columns} FROM {table} WHERE tenant_id = ? {filter} ORDER BY id ASC");

        match window {
            None => {
                sqlx::query_as(&base)
                    .bind(tenant_id)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(window) => {
                sqlx::query_as(&format!("{base} LIMIT ? OFFSET ?"))
                    .bind(tenant_id)
                    .bind(window.limit as i64)
                    .bind(window.offset as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
    }

    async fn count_kind(&self, tenant_id: &str, kind: &KindSpec) -> u64 {
        let table = kind.table();
        let count = |filter: &'static str| {
            let sql = format!("SELECT COUNT(*) FROM {table} WHERE tenant_id = ? {filter}");
            async move {
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(tenant_id)
                    .fetch_one(&self.pool)
                    .await
            }
        };

        let result = match count(Projection::full().live_filter()).await {
            Err(err) if matches!(schema::classify(&err), Some(SchemaDrift::MissingColumn(_))) => {
                match Projection::for_table(&self.pool, table).await {
                    Ok(projection) => count(projection.live_filter()).await,
                    Err(err) => Err(err),
                }
            }
            other => other,
        };

        match result {
            Ok(n) => n.max(0) as u64,
            Err(err) => {
                tracing::warn!("Snapshot count degraded for kind {}: {}", kind.name, err);
                0
            }
        }
    }
}
