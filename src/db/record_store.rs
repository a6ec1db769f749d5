//! Versioned record store.
//!
//! One generic upsert / soft-delete implementation shared by every entity
//! kind. Concurrency control is optimistic: a write carries the version the
//! caller last saw, and the single conditional statement below only applies
//! it when that version is still current. Conflicting writers fail fast with
//! the stored record; nothing is merged and nothing waits.
//!
//! Writes take the database write lock when they begin, then stamp the row
//! with a time strictly after every stamp the tenant already has in that
//! table. Commit order and `(updated_at, id)` order therefore agree, which
//! is what lets the change feed resume from a cursor without gaps.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::schema::RECORD_COLUMNS;
use crate::fanout::EventBus;
use crate::models::{
    format_timestamp, now, parse_timestamp, ChangeEvent, KindRegistry, KindSpec, Record, RecordRow,
};

/// A create-or-update request.
#[derive(Debug, Clone, Default)]
pub struct UpsertRequest {
    /// Record id. Generated when absent.
    pub id: Option<String>,
    /// Version the caller last saw. `None` skips the check.
    pub expected_version: Option<i64>,
    pub payload: Value,
}

/// Result of a successful upsert.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub record: Record,
    /// True when the row did not exist before this write.
    pub created: bool,
}

/// Optimistic-concurrency store over the per-kind tables.
#[derive(Clone)]
pub struct VersionedRecordStore {
    pool: SqlitePool,
    kinds: Arc<KindRegistry>,
    events: Arc<dyn EventBus>,
}

impl VersionedRecordStore {
    pub fn new(pool: SqlitePool, kinds: Arc<KindRegistry>, events: Arc<dyn EventBus>) -> Self {
        Self { pool, kinds, events }
    }

    fn kind(&self, name: &str) -> StoreResult<&KindSpec> {
        self.kinds
            .get(name)
            .ok_or_else(|| StoreError::UnknownKind(name.to_string()))
    }

    /// Creates or updates a record.
    ///
    /// - no id: a fresh id is generated and the row is inserted at version 1
    /// - unknown id: inserted at version 1, `expected_version` is ignored
    /// - live row: applied only if `expected_version` is `None` or matches;
    ///   otherwise [`StoreError::VersionConflict`] with the stored record
    /// - tombstoned row: resurrected (`deleted_at` cleared, version bumped)
    pub async fn upsert(
        &self,
        tenant_id: &str,
        kind: &str,
        request: UpsertRequest,
    ) -> StoreResult<Upserted> {
        let kind = self.kind(kind)?;
        validate_tenant(tenant_id)?;

        if !request.payload.is_object() {
            return Err(StoreError::Invalid("payload must be a JSON object".to_string()));
        }

        let id = match request.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => return Err(StoreError::Invalid("id must not be empty".to_string())),
            None => Uuid::new_v4().to_string(),
        };
        let natural_key = kind.natural_key_of(&request.payload);
        let payload = serde_json::to_string(&request.payload)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut tx = super::begin_write(&self.pool).await?;

        if let Some(key) = natural_key.as_deref() {
            remediate_natural_key(&mut tx, kind, tenant_id, &id, key).await?;
        }

        let stamp = next_stamp(&mut tx, kind, tenant_id).await?;
        let table = kind.table();
        let sql = format!(
            r#"
            INSERT INTO {table} (tenant_id, id, version, updated_at, deleted_at, natural_key, payload)
            VALUES (?1, ?2, 1, ?6, NULL, ?3, ?4)
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                version = COALESCE({table}.version, 1) + 1,
                updated_at = excluded.updated_at,
                deleted_at = NULL,
                natural_key = excluded.natural_key,
                payload = excluded.payload
            WHERE ?5 IS NULL
               OR {table}.deleted_at IS NOT NULL
               OR COALESCE({table}.version, 1) = ?5
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(&id)
            .bind(&natural_key)
            .bind(&payload)
            .bind(request.expected_version)
            .bind(&stamp)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_write_error(e, kind, natural_key.as_deref()))?;

        let Some(row) = row else {
            // The version predicate rejected the write.
            let current = fetch_row(&mut tx, kind, tenant_id, &id).await?;
            tx.rollback().await?;

            return match current {
                Some(current) => {
                    tracing::debug!(
                        "Version conflict on {}/{} for tenant {}: expected {:?}, stored {}",
                        kind.name,
                        id,
                        tenant_id,
                        request.expected_version,
                        current.version
                    );
                    Err(StoreError::VersionConflict {
                        kind: kind.name.clone(),
                        id,
                        expected: request.expected_version.unwrap_or_default(),
                        current: Box::new(current),
                    })
                }
                None => Err(StoreError::NotFound {
                    kind: kind.name.clone(),
                    id,
                }),
            };
        };

        tx.commit().await?;

        let record = row.into_record(&kind.name)?;
        self.events.publish(ChangeEvent::upserted(&feed_view(&record, kind)));

        Ok(Upserted {
            created: record.version == 1,
            record,
        })
    }

    /// Tombstones a record.
    ///
    /// Deleting an already-deleted record succeeds: the original `deleted_at`
    /// is kept and the version still increments.
    pub async fn soft_delete(
        &self,
        tenant_id: &str,
        kind: &str,
        id: &str,
        expected_version: Option<i64>,
    ) -> StoreResult<Record> {
        let kind = self.kind(kind)?;
        validate_tenant(tenant_id)?;

        let table = kind.table();
        let sql = format!(
            r#"
            UPDATE {table} SET
                version = COALESCE(version, 1) + 1,
                updated_at = ?4,
                deleted_at = COALESCE(deleted_at, ?4)
            WHERE tenant_id = ?1 AND id = ?2
              AND (?3 IS NULL OR COALESCE(version, 1) = ?3)
            RETURNING {RECORD_COLUMNS}
            "#
        );

        let mut tx = super::begin_write(&self.pool).await?;
        let stamp = next_stamp(&mut tx, kind, tenant_id).await?;

        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(id)
            .bind(expected_version)
            .bind(&stamp)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            let current = fetch_row(&mut tx, kind, tenant_id, id).await?;
            tx.rollback().await?;

            return match current {
                Some(current) => Err(StoreError::VersionConflict {
                    kind: kind.name.clone(),
                    id: id.to_string(),
                    expected: expected_version.unwrap_or_default(),
                    current: Box::new(current),
                }),
                None => Err(StoreError::NotFound {
                    kind: kind.name.clone(),
                    id: id.to_string(),
                }),
            };
        };

        tx.commit().await?;

        let record = row.into_record(&kind.name)?;
        self.events.publish(ChangeEvent::deleted(&feed_view(&record, kind)));

        Ok(record)
    }

    /// Fetches one record in full, heavy fields and tombstones included.
    pub async fn get(&self, tenant_id: &str, kind: &str, id: &str) -> StoreResult<Record> {
        let kind = self.kind(kind)?;
        let table = kind.table();

        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM {table} WHERE tenant_id = ? AND id = ?"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_record(&kind.name)?),
            None => Err(StoreError::NotFound {
                kind: kind.name.clone(),
                id: id.to_string(),
            }),
        }
    }
}

fn validate_tenant(tenant_id: &str) -> StoreResult<()> {
    if tenant_id.trim().is_empty() {
        return Err(StoreError::Invalid("tenant id must not be empty".to_string()));
    }
    Ok(())
}

/// The record as subscribers see it: heavy fields are only served by GET.
fn feed_view(record: &Record, kind: &KindSpec) -> Record {
    let mut view = record.clone();
    view.strip_fields(&kind.heavy_fields);
    view
}

/// Picks the `updated_at` for a write, formatted for storage.
///
/// The wall clock, unless the tenant already has a stamp at or past it in
/// this table, in which case one microsecond after the newest one. Must run
/// inside a write transaction so no other stamp can land in between.
async fn next_stamp(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &KindSpec,
    tenant_id: &str,
) -> StoreResult<String> {
    let table = kind.table();
    let latest: Option<String> = sqlx::query_scalar(&format!(
        "SELECT MAX(updated_at) FROM {table} WHERE tenant_id = ?"
    ))
    .bind(tenant_id)
    .fetch_one(&mut **tx)
    .await?;

    let latest = latest.as_deref().map(parse_timestamp).transpose()?;
    Ok(format_timestamp(&stamp_after(now(), latest)))
}

fn stamp_after(clock: DateTime<Utc>, latest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match latest {
        Some(latest) if latest >= clock => latest + Duration::microseconds(1),
        _ => clock,
    }
}

async fn fetch_row(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &KindSpec,
    tenant_id: &str,
    id: &str,
) -> StoreResult<Option<Record>> {
    let table = kind.table();
    let row: Option<RecordRow> = sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM {table} WHERE tenant_id = ? AND id = ?"
    ))
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| r.into_record(&kind.name)).transpose()?)
}

/// Frees a natural key held by a tombstone under a different id.
///
/// When the key belongs to a tombstoned row and the target id is unused, the
/// tombstone is renamed to the target id so the following upsert resurrects
/// it and its version history continues. A live holder is a duplicate.
async fn remediate_natural_key(
    tx: &mut Transaction<'_, Sqlite>,
    kind: &KindSpec,
    tenant_id: &str,
    id: &str,
    key: &str,
) -> StoreResult<()> {
    let table = kind.table();

    let holder: Option<(String, Option<String>)> = sqlx::query_as(&format!(
        "SELECT id, deleted_at FROM {table} WHERE tenant_id = ? AND natural_key = ? AND id <> ?"
    ))
    .bind(tenant_id)
    .bind(key)
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    let Some((holder_id, deleted_at)) = holder else {
        return Ok(());
    };

    let duplicate = || StoreError::DuplicateKey {
        kind: kind.name.clone(),
        field: kind.natural_key.clone().unwrap_or_default(),
        value: key.to_string(),
    };

    if deleted_at.is_none() {
        return Err(duplicate());
    }

    let target_taken: Option<(i64,)> =
        sqlx::query_as(&format!("SELECT 1 FROM {table} WHERE tenant_id = ? AND id = ?"))
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
    if target_taken.is_some() {
        return Err(duplicate());
    }

    sqlx::query(&format!(
        "UPDATE {table} SET id = ? WHERE tenant_id = ? AND id = ?"
    ))
    .bind(id)
    .bind(tenant_id)
    .bind(&holder_id)
    .execute(&mut **tx)
    .await?;

    tracing::info!(
        "Retargeted tombstoned {} {} -> {} to free {} '{}' (tenant {})",
        kind.name,
        holder_id,
        id,
        kind.natural_key.as_deref().unwrap_or("key"),
        key,
        tenant_id
    );

    Ok(())
}

fn map_write_error(err: sqlx::Error, kind: &KindSpec, natural_key: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::DuplicateKey {
                kind: kind.name.clone(),
                field: kind.natural_key.clone().unwrap_or_else(|| "id".to_string()),
                value: natural_key.unwrap_or_default().to_string(),
            };
        }
    }
    StoreError::Database(err)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::fanout::SyncHub;
    use crate::models::EventType;
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) async fn setup() -> (VersionedRecordStore, Arc<SyncHub>, SqlitePool, TempDir) {
        let (pool, dir) = test_pool().await;
        let hub = Arc::new(SyncHub::default());
        let store = VersionedRecordStore::new(
            pool.clone(),
            Arc::new(KindRegistry::default()),
            hub.clone(),
        );
        (store, hub, pool, dir)
    }

    fn create(payload: Value) -> UpsertRequest {
        UpsertRequest {
            id: None,
            expected_version: None,
            payload,
        }
    }

    fn update(id: &str, version: Option<i64>, payload: Value) -> UpsertRequest {
        UpsertRequest {
            id: Some(id.to_string()),
            expected_version: version,
            payload,
        }
    }

    #[tokio::test]
    async fn test_create_without_id_generates_one() {
        let (store, _hub, _pool, _dir) = setup().await;

        let result = store
            .upsert("acme", "budget", create(json!({"amount": 100})))
            .await
            .unwrap();

        assert!(result.created);
        assert_eq!(result.record.version, 1);
        assert!(Uuid::parse_str(&result.record.id).is_ok());
        assert_eq!(result.record.tenant_id, "acme");
        assert!(!result.record.is_deleted());
    }

    #[tokio::test]
    async fn test_create_with_unknown_id_ignores_expected_version() {
        let (store, _hub, _pool, _dir) = setup().await;

        let result = store
            .upsert("acme", "budget", update("b1", Some(7), json!({})))
            .await
            .unwrap();

        assert!(result.created);
        assert_eq!(result.record.id, "b1");
        assert_eq!(result.record.version, 1);
    }

    #[tokio::test]
    async fn test_versions_increase_without_gaps() {
        let (store, _hub, _pool, _dir) = setup().await;

        let mut last = store
            .upsert("acme", "budget", update("b1", None, json!({"n": 0})))
            .await
            .unwrap()
            .record;

        for n in 1..6 {
            let next = store
                .upsert("acme", "budget", update("b1", Some(last.version), json!({"n": n})))
                .await
                .unwrap()
                .record;
            assert_eq!(next.version, last.version + 1);
            assert!(next.updated_at >= last.updated_at);
            last = next;
        }
        assert_eq!(last.version, 6);
        assert_eq!(last.payload, json!({"n": 5}));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected_and_row_unchanged() {
        let (store, _hub, _pool, _dir) = setup().await;

        store
            .upsert("acme", "budget", update("b1", None, json!({"amount": 1})))
            .await
            .unwrap();
        store
            .upsert("acme", "budget", update("b1", Some(1), json!({"amount": 2})))
            .await
            .unwrap();

        let err = store
            .upsert("acme", "budget", update("b1", Some(1), json!({"amount": 3})))
            .await
            .unwrap_err();

        match err {
            StoreError::VersionConflict {
                expected, current, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(current.version, 2);
                assert_eq!(current.payload, json!({"amount": 2}));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let stored = store.get("acme", "budget", "b1").await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload, json!({"amount": 2}));
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "budget", update("b1", None, json!({})))
            .await
            .unwrap();

        let a = store.upsert("acme", "budget", update("b1", Some(1), json!({"by": "a"})));
        let b = store.upsert("acme", "budget", update("b1", Some(1), json!({"by": "b"})));
        let (a, b) = tokio::join!(a, b);

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

        let stored = store.get("acme", "budget", "b1").await.unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invoice_writers_one_wins() {
        let (store, _hub, _pool, _dir) = setup().await;
        let mut version = store
            .upsert("acme", "invoice", update("i1", None, json!({"number": "INV-1"})))
            .await
            .unwrap()
            .record
            .version;

        for round in 0..20 {
            let writers: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|by| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        store
                            .upsert(
                                "acme",
                                "invoice",
                                update("i1", Some(version), json!({"number": "INV-1", "by": by})),
                            )
                            .await
                    })
                })
                .collect();

            let mut winners = 0;
            for writer in writers {
                match writer.await.unwrap() {
                    Ok(_) => winners += 1,
                    Err(StoreError::VersionConflict { .. }) => {}
                    Err(other) => panic!("round {}: unexpected error {:?}", round, other),
                }
            }
            assert_eq!(winners, 1, "round {}", round);

            version += 1;
            assert_eq!(store.get("acme", "invoice", "i1").await.unwrap().version, version);
        }
    }

    #[tokio::test]
    async fn test_stamps_strictly_increase_per_tenant() {
        let (store, _hub, _pool, _dir) = setup().await;
        let mut last = None;
        for n in 0..30 {
            let record = if n % 3 == 2 {
                store.soft_delete("acme", "budget", &format!("b{}", n - 1), None).await.unwrap()
            } else {
                store
                    .upsert("acme", "budget", update(&format!("b{n}"), None, json!({})))
                    .await
                    .unwrap()
                    .record
            };
            if let Some(last) = last {
                assert!(record.updated_at > last, "write {} did not move forward", n);
            }
            last = Some(record.updated_at);
        }
    }

    #[test]
    fn test_stamp_after_clock_and_latest() {
        let clock = crate::models::parse_timestamp("2024-06-01T12:00:00.000000Z").unwrap();
        let earlier = clock - Duration::seconds(1);
        let later = clock + Duration::seconds(1);

        assert_eq!(stamp_after(clock, None), clock);
        assert_eq!(stamp_after(clock, Some(earlier)), clock);
        assert_eq!(stamp_after(clock, Some(clock)), clock + Duration::microseconds(1));
        assert_eq!(stamp_after(clock, Some(later)), later + Duration::microseconds(1));
    }

    #[tokio::test]
    async fn test_soft_delete_and_repeat() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "budget", update("b1", None, json!({})))
            .await
            .unwrap();

        let deleted = store.soft_delete("acme", "budget", "b1", None).await.unwrap();
        assert_eq!(deleted.version, 2);
        let first_deleted_at = deleted.deleted_at.unwrap();

        let again = store.soft_delete("acme", "budget", "b1", None).await.unwrap();
        assert_eq!(again.version, 3);
        assert_eq!(again.deleted_at, Some(first_deleted_at));
    }

    #[tokio::test]
    async fn test_soft_delete_missing_is_not_found() {
        let (store, _hub, _pool, _dir) = setup().await;
        let err = store
            .soft_delete("acme", "budget", "ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_soft_delete_with_stale_version_conflicts() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "budget", update("b1", None, json!({})))
            .await
            .unwrap();
        store
            .upsert("acme", "budget", update("b1", Some(1), json!({})))
            .await
            .unwrap();

        let err = store
            .soft_delete("acme", "budget", "b1", Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(!store.get("acme", "budget", "b1").await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_create_over_tombstone_resurrects() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "budget", update("b1", None, json!({"v": 1})))
            .await
            .unwrap();
        store.soft_delete("acme", "budget", "b1", None).await.unwrap();

        let revived = store
            .upsert("acme", "budget", update("b1", None, json!({"v": 2})))
            .await
            .unwrap();

        assert!(!revived.created);
        assert_eq!(revived.record.version, 3);
        assert!(!revived.record.is_deleted());
        assert_eq!(revived.record.payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_legacy_null_version_counts_as_one() {
        let (store, _hub, pool, _dir) = setup().await;
        sqlx::query(
            "INSERT INTO budgets (tenant_id, id, version, updated_at, payload) VALUES ('acme', 'old', NULL, '2020-01-01T00:00:00.000000Z', '{}')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let updated = store
            .upsert("acme", "budget", update("old", Some(1), json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(updated.record.version, 2);
    }

    #[tokio::test]
    async fn test_tenants_do_not_see_each_other() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("tenant-a", "budget", update("shared-id", None, json!({"owner": "a"})))
            .await
            .unwrap();
        let b = store
            .upsert("tenant-b", "budget", update("shared-id", None, json!({"owner": "b"})))
            .await
            .unwrap();

        assert!(b.created);
        let a = store.get("tenant-a", "budget", "shared-id").await.unwrap();
        assert_eq!(a.payload["owner"], "a");
        assert!(store.get("tenant-c", "budget", "shared-id").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_live_natural_key_rejected() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "invoice", update("i1", None, json!({"number": "INV-1"})))
            .await
            .unwrap();

        let err = store
            .upsert("acme", "invoice", update("i2", None, json!({"number": "INV-1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref value, .. } if value == "INV-1"));

        // Another tenant may reuse the number.
        store
            .upsert("globex", "invoice", update("i2", None, json!({"number": "INV-1"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tombstoned_natural_key_is_retargeted() {
        let (store, _hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "invoice", update("old-id", None, json!({"number": "INV-9"})))
            .await
            .unwrap();
        store.soft_delete("acme", "invoice", "old-id", None).await.unwrap();

        let revived = store
            .upsert("acme", "invoice", update("new-id", None, json!({"number": "INV-9", "total": 5})))
            .await
            .unwrap();

        assert_eq!(revived.record.id, "new-id");
        assert_eq!(revived.record.version, 3);
        assert!(!revived.record.is_deleted());
        assert!(matches!(
            store.get("acme", "invoice", "old-id").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_and_bad_payload() {
        let (store, _hub, _pool, _dir) = setup().await;
        assert!(matches!(
            store.upsert("acme", "spaceship", create(json!({}))).await,
            Err(StoreError::UnknownKind(_))
        ));
        assert!(matches!(
            store.upsert("acme", "budget", create(json!([1, 2]))).await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.upsert("  ", "budget", create(json!({}))).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_are_published() {
        let (store, hub, _pool, _dir) = setup().await;
        let mut rx = hub.subscribe("acme");
        let mut other = hub.subscribe("globex");

        let created = store
            .upsert("acme", "budget", update("b1", None, json!({})))
            .await
            .unwrap();
        store.soft_delete("acme", "budget", "b1", None).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, EventType::RecordUpserted);
        assert_eq!(first.record().unwrap(), created.record);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.event_type, EventType::RecordDeleted);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_published_events_omit_heavy_fields() {
        let (store, hub, _pool, _dir) = setup().await;
        let mut rx = hub.subscribe("acme");

        let written = store
            .upsert(
                "acme",
                "invoice",
                update("i1", None, json!({"number": "INV-1", "pdf_blob": "JVBERi0="})),
            )
            .await
            .unwrap();
        assert_eq!(written.record.payload["pdf_blob"], "JVBERi0=");
        store.soft_delete("acme", "invoice", "i1", None).await.unwrap();

        let upserted = rx.try_recv().unwrap().record().unwrap();
        assert_eq!(upserted.payload, json!({"number": "INV-1"}));
        assert_eq!(upserted.version, 1);

        let deleted = rx.try_recv().unwrap().record().unwrap();
        assert_eq!(deleted.payload, json!({"number": "INV-1"}));
        assert!(deleted.is_deleted());
    }

    #[tokio::test]
    async fn test_failed_write_is_not_published() {
        let (store, hub, _pool, _dir) = setup().await;
        store
            .upsert("acme", "budget", update("b1", None, json!({})))
            .await
            .unwrap();
        store
            .upsert("acme", "budget", update("b1", Some(1), json!({})))
            .await
            .unwrap();

        let mut rx = hub.subscribe("acme");
        let _ = store
            .upsert("acme", "budget", update("b1", Some(1), json!({})))
            .await;
        assert!(rx.try_recv().is_err());
    }
}
