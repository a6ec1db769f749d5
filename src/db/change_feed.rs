//! Incremental change feed.
//!
//! Each requested kind is queried independently and concurrently. A kind
//! whose table is missing or has drifted degrades to an empty list with a
//! warning; it never fails the whole pull. Consistency holds within a kind,
//! not across kinds.
//!
//! Feed rows omit the kind's heavy fields; a client that needs them fetches
//! the record on its own.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::{StoreError, StoreResult};
use super::schema::{self, Projection, SchemaDrift, RECORD_COLUMNS};
use super::tombstones;
use crate::models::{format_timestamp, FeedCursor, KindPosition, KindRegistry, KindSpec, Record, RecordRow};

pub const DEFAULT_FEED_LIMIT: usize = 500;
pub const MAX_FEED_LIMIT: usize = 5000;

/// Parameters of one pull.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub cursor: FeedCursor,
    /// Per-kind page size. Defaults and clamping are applied by the feed.
    pub limit: Option<usize>,
    /// Kinds to include. `None` means all registered kinds.
    pub kinds: Option<Vec<String>>,
}

impl PullRequest {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self::from_cursor(FeedCursor::from_since(since))
    }

    pub fn from_cursor(cursor: FeedCursor) -> Self {
        Self {
            cursor,
            limit: None,
            kinds: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = Some(kinds);
        self
    }
}

/// One page of the change feed.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub since: DateTime<Utc>,
    /// Changed rows per kind, live and tombstoned alike.
    pub entities: BTreeMap<String, Vec<Record>>,
    /// Kinds that were truncated at `limit`.
    pub kind_has_more: BTreeMap<String, bool>,
    /// True if any kind has more rows; the client should pull again at once.
    pub has_more: bool,
    /// Resume point for the next pull.
    pub next_cursor: FeedCursor,
    /// Latest `updated_at` among returned rows, or the request's high-water
    /// mark when nothing changed.
    pub updated_at: DateTime<Utc>,
    pub limit: usize,
}

impl FeedPage {
    pub fn record_count(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    pool: SqlitePool,
    kinds: Arc<KindRegistry>,
    default_limit: usize,
    max_limit: usize,
}

impl ChangeFeed {
    pub fn new(pool: SqlitePool, kinds: Arc<KindRegistry>) -> Self {
        Self {
            pool,
            kinds,
            default_limit: DEFAULT_FEED_LIMIT,
            max_limit: MAX_FEED_LIMIT,
        }
    }

    pub fn with_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self.default_limit = default_limit.clamp(1, self.max_limit);
        self
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    /// Returns rows of the tenant changed after the cursor.
    pub async fn pull(&self, tenant_id: &str, request: PullRequest) -> StoreResult<FeedPage> {
        let limit = self.effective_limit(request.limit);
        let (selected, unknown) = self.kinds.select(request.kinds.as_deref());
        if !unknown.is_empty() {
            tracing::warn!("Skipping unknown kinds in change feed: {}", unknown.join(", "));
        }

        let cursor = request.cursor;
        self.check_horizon(tenant_id, &cursor, &selected).await?;

        let pages = join_all(selected.iter().map(|kind| {
            let position = cursor.position(&kind.name);
            self.fetch_kind(tenant_id, kind, cursor.since, position, limit)
        }))
        .await;

        let mut next_cursor = cursor.clone();
        let mut entities = BTreeMap::new();
        let mut kind_has_more = BTreeMap::new();
        let mut updated_at: Option<DateTime<Utc>> = None;

        for (kind, (records, more)) in selected.iter().zip(pages) {
            if let Some(last) = records.last() {
                next_cursor.advance(&kind.name, last.updated_at, &last.id);
            }
            for record in &records {
                updated_at = Some(updated_at.map_or(record.updated_at, |t| t.max(record.updated_at)));
            }
            kind_has_more.insert(kind.name.clone(), more);
            entities.insert(kind.name.clone(), records);
        }
        for name in unknown {
            entities.insert(name, Vec::new());
        }

        let page = FeedPage {
            since: cursor.since,
            has_more: kind_has_more.values().any(|more| *more),
            updated_at: updated_at.unwrap_or_else(|| cursor.high_water_mark()),
            entities,
            kind_has_more,
            next_cursor,
            limit,
        };

        tracing::debug!(
            "Change feed for tenant {}: {} record(s), has_more={}",
            tenant_id,
            page.record_count(),
            page.has_more
        );

        Ok(page)
    }

    /// Rejects cursors older than the tenant's tombstone purge horizon.
    async fn check_horizon(
        &self,
        tenant_id: &str,
        cursor: &FeedCursor,
        selected: &[&KindSpec],
    ) -> StoreResult<()> {
        let Some(horizon) = tombstones::load_horizon(&self.pool, tenant_id).await? else {
            return Ok(());
        };

        let oldest = selected
            .iter()
            .map(|kind| {
                cursor
                    .position(&kind.name)
                    .map_or(cursor.since, |p| p.updated_at)
            })
            .min()
            .unwrap_or(cursor.since);

        if oldest < horizon {
            return Err(StoreError::CursorExpired { horizon });
        }
        Ok(())
    }

    /// Fetches one kind's page. Never fails: problems degrade to an empty page.
    async fn fetch_kind(
        &self,
        tenant_id: &str,
        kind: &KindSpec,
        since: DateTime<Utc>,
        position: Option<&KindPosition>,
        limit: usize,
    ) -> (Vec<Record>, bool) {
        let rows = match self
            .query_kind(RECORD_COLUMNS, tenant_id, kind, since, position, limit)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(err) => match schema::classify(&err) {
                Some(SchemaDrift::MissingColumn(column)) => {
                    tracing::debug!(
                        "Kind {} lacks column {}, retrying with the columns it has",
                        kind.name,
                        column
                    );
                    match Projection::for_table(&self.pool, kind.table()).await {
                        Ok(projection) => {
                            self.query_kind(&projection.columns, tenant_id, kind, since, position, limit)
                                .await
                        }
                        Err(err) => Err(err),
                    }
                }
                _ => Err(err),
            },
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Change feed degraded for kind {}: {}", kind.name, err);
                return (Vec::new(), false);
            }
        };

        let mut records = match rows
            .into_iter()
            .map(|row| row.into_record(&kind.name))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("Change feed degraded for kind {}: {}", kind.name, err);
                return (Vec::new(), false);
            }
        };

        let has_more = records.len() > limit;
        records.truncate(limit);
        for record in &mut records {
            record.strip_fields(&kind.heavy_fields);
        }
        (records, has_more)
    }

    async fn query_kind(
        &self,
        columns: &str,
        tenant_id: &str,
        kind: &KindSpec,
        since: DateTime<Utc>,
        position: Option<&KindPosition>,
        limit: usize,
    ) -> Result<Vec<RecordRow>, sqlx::Error> {
        let table = kind.table();
        let fetch = (limit + 1) as i64;

        match position {
            None => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {columns} FROM {table}
                    WHERE tenant_id = ?1 AND updated_at > ?2
                    ORDER BY updated_at ASC, id ASC
                    LIMIT ?3
                    "#
                ))
                .bind(tenant_id)
                .bind(format_timestamp(&since))
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            Some(position) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {columns} FROM {table}
                    WHERE tenant_id = ?1
                      AND (updated_at > ?2 OR (updated_at = ?2 AND id > ?3))
                    ORDER BY updated_at ASC, id ASC
                    LIMIT ?4
                    "#
                ))
                .bind(tenant_id)
                .bind(format_timestamp(&position.updated_at))
                .bind(&position.id)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
        }
    }
}
