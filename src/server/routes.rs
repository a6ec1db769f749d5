//! HTTP routes.
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /me`: Returns the caller's tenant and user
//! - `POST /records/{kind}`: Create (or upsert when the body carries an id)
//! - `GET|PUT|DELETE /records/{kind}/{id}`: Read, conditional upsert, soft delete
//! - `GET /state/changes`: Incremental change feed
//! - `GET /state/bulk`, `GET /state/bulk-chunked`: Snapshots
//! - `GET /realtime`: WebSocket event stream

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, ApiKeyStore, TenantContext};
use super::config::ServerConfig;
use super::error::{ApiError, ApiResult};
use super::realtime;
use crate::db::{ChangeFeed, PullRequest, SnapshotLoader, UpsertRequest, VersionedRecordStore};
use crate::fanout::{EventBus, SyncHub};
use crate::models::{parse_kind_list, parse_timestamp, FeedCursor, KindRegistry, Record};

/// Header carrying the caller's last known version, as an alternative to `If-Match`.
pub const VERSION_HEADER: &str = "x-record-version";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: VersionedRecordStore,
    pub feed: ChangeFeed,
    pub snapshot: SnapshotLoader,
    pub events: Arc<dyn EventBus>,
    pub api_keys: Arc<ApiKeyStore>,
}

impl AppState {
    pub fn new(pool: SqlitePool, kinds: KindRegistry, config: &ServerConfig) -> Self {
        let kinds = Arc::new(kinds);
        let events: Arc<dyn EventBus> = Arc::new(SyncHub::new(config.realtime.channel_capacity));

        Self {
            store: VersionedRecordStore::new(pool.clone(), kinds.clone(), events.clone()),
            feed: ChangeFeed::new(pool.clone(), kinds.clone())
                .with_limits(config.feed.default_limit, config.feed.max_limit),
            snapshot: SnapshotLoader::new(pool, kinds)
                .with_limits(config.snapshot.default_chunk, config.snapshot.max_chunk),
            events,
            api_keys: Arc::new(ApiKeyStore::from_entries(&config.api_keys)),
        }
    }
}

/// Builds the full application router.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/me", get(me))
        .route("/records/{kind}", post(create_record))
        .route(
            "/records/{kind}/{id}",
            get(get_record).put(put_record).delete(delete_record),
        )
        .route("/state/changes", get(changes))
        .route("/state/bulk", get(bulk))
        .route("/state/bulk-chunked", get(bulk_chunked))
        .route("/realtime", get(realtime::realtime))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Service
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct MeResponse {
    tenant_id: String,
    user_id: String,
}

async fn me(Extension(ctx): Extension<TenantContext>) -> Json<MeResponse> {
    Json(MeResponse {
        tenant_id: ctx.tenant_id,
        user_id: ctx.user_id,
    })
}

// ============================================================================
// Records
// ============================================================================

/// Write request body.
#[derive(Debug, Deserialize)]
pub struct WriteBody {
    #[serde(default)]
    pub id: Option<String>,
    /// Last known version; headers take precedence.
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub payload: Value,
}

/// Reads the expected version from `If-Match` or `X-Record-Version`.
fn header_version(headers: &HeaderMap) -> ApiResult<Option<i64>> {
    for name in [header::IF_MATCH.as_str(), VERSION_HEADER] {
        let Some(value) = headers.get(name) else {
            continue;
        };
        let text = value
            .to_str()
            .map_err(|_| ApiError::BadRequest(format!("{name} header is not valid text")))?;
        let text = text.trim();
        let text = text.strip_prefix("W/").unwrap_or(text).trim_matches('"');
        return text
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{name} header must be a version number")));
    }
    Ok(None)
}

fn record_response(status: StatusCode, record: Record) -> impl IntoResponse {
    let etag = format!("\"{}\"", record.version);
    (status, [(header::ETAG, etag)], Json(record))
}

async fn write_record(
    state: &AppState,
    ctx: &TenantContext,
    kind: &str,
    id: Option<String>,
    headers: &HeaderMap,
    body: WriteBody,
) -> ApiResult<impl IntoResponse> {
    let expected_version = header_version(headers)?.or(body.version);

    let result = state
        .store
        .upsert(
            &ctx.tenant_id,
            kind,
            UpsertRequest {
                id,
                expected_version,
                payload: body.payload,
            },
        )
        .await?;

    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(record_response(status, result.record))
}

async fn create_record(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<WriteBody>,
) -> ApiResult<impl IntoResponse> {
    let id = body.id.take();
    write_record(&state, &ctx, &kind, id, &headers, body).await
}

async fn put_record(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<WriteBody>,
) -> ApiResult<impl IntoResponse> {
    if body.id.as_deref().is_some_and(|body_id| body_id != id) {
        return Err(ApiError::BadRequest("body id does not match the URL".to_string()));
    }
    write_record(&state, &ctx, &kind, Some(id), &headers, body).await
}

async fn delete_record(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let expected_version = header_version(&headers)?;
    let record = state
        .store
        .soft_delete(&ctx.tenant_id, &kind, &id, expected_version)
        .await?;
    Ok(record_response(StatusCode::OK, record))
}

async fn get_record(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let record = state.store.get(&ctx.tenant_id, &kind, &id).await?;
    Ok(record_response(StatusCode::OK, record))
}

// ============================================================================
// Sync
// ============================================================================

fn requested_kinds(entities: Option<&str>) -> Option<Vec<String>> {
    entities.map(parse_kind_list).filter(|kinds| !kinds.is_empty())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    pub since: Option<String>,
    /// Token from a previous `next_cursor`, or an ISO 8601 timestamp.
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub entities: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub since: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub entities: BTreeMap<String, Vec<Record>>,
    pub has_more: bool,
    #[serde(default)]
    pub kind_has_more: BTreeMap<String, bool>,
    pub next_cursor: String,
    pub limit: usize,
}

async fn changes(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<ChangesQuery>,
) -> ApiResult<Json<ChangesResponse>> {
    let cursor = match (non_empty(&query.cursor), non_empty(&query.since)) {
        (Some(token), _) => {
            FeedCursor::decode(token).map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
        (None, Some(since)) => FeedCursor::from_since(
            parse_timestamp(since).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        (None, None) => FeedCursor::from_since(DateTime::<Utc>::UNIX_EPOCH),
    };

    let mut request = PullRequest::from_cursor(cursor);
    request.limit = query.limit;
    request.kinds = requested_kinds(query.entities.as_deref());

    let page = state.feed.pull(&ctx.tenant_id, request).await?;

    Ok(Json(ChangesResponse {
        since: page.since,
        updated_at: page.updated_at,
        next_cursor: page.next_cursor.encode(),
        entities: page.entities,
        has_more: page.has_more,
        kind_has_more: page.kind_has_more,
        limit: page.limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BulkQuery {
    pub entities: Option<String>,
}

async fn bulk(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<BulkQuery>,
) -> ApiResult<Json<BTreeMap<String, Vec<Record>>>> {
    let kinds = requested_kinds(query.entities.as_deref());
    let snapshot = state
        .snapshot
        .load_bulk(&ctx.tenant_id, kinds.as_deref())
        .await?;
    Ok(Json(snapshot.entities))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub entities: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub entities: BTreeMap<String, Vec<Record>>,
    pub totals: BTreeMap<String, u64>,
    pub has_more: bool,
    pub next_offset: Option<usize>,
    pub limit: usize,
    pub offset: usize,
    /// Server time the page was read at.
    pub loaded_at: DateTime<Utc>,
}

async fn bulk_chunked(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<ChunkQuery>,
) -> ApiResult<Json<ChunkResponse>> {
    let kinds = requested_kinds(query.entities.as_deref());
    let page = state
        .snapshot
        .load_chunk(&ctx.tenant_id, query.limit, query.offset, kinds.as_deref())
        .await?;

    Ok(Json(ChunkResponse {
        entities: page.entities,
        totals: page.totals,
        has_more: page.has_more,
        next_offset: page.next_offset,
        limit: page.limit,
        offset: page.offset,
        loaded_at: page.loaded_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{format_timestamp, now};
    use crate::server::config::ApiKeyEntry;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, SqlitePool, TempDir) {
        let (pool, dir) = test_pool().await;
        let config = ServerConfig {
            api_keys: vec![
                ApiKeyEntry {
                    key: "acme-key".to_string(),
                    tenant_id: "acme".to_string(),
                    user_id: "alice".to_string(),
                },
                ApiKeyEntry {
                    key: "globex-key".to_string(),
                    tenant_id: "globex".to_string(),
                    user_id: "bob".to_string(),
                },
            ],
            ..ServerConfig::default()
        };
        let state = AppState::new(pool.clone(), KindRegistry::default(), &config);
        (router(state), pool, dir)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        key: Option<&str>,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _pool, _dir) = app().await;
        let (status, body) = send(&app, "GET", "/health", None, &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_auth_is_required() {
        let (app, _pool, _dir) = app().await;

        let (status, body) = send(&app, "GET", "/me", None, &[], None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_auth");

        let (status, body) = send(&app, "GET", "/me", Some("nope"), &[], None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_key");

        let (status, body) = send(&app, "GET", "/me", Some("acme-key"), &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenant_id"], "acme");
        assert_eq!(body["user_id"], "alice");
    }

    #[tokio::test]
    async fn test_budget_conflict_scenario_over_http() {
        let (app, _pool, _dir) = app().await;
        let before = format_timestamp(&(now() - chrono::Duration::seconds(1)));
        let key = Some("acme-key");

        let (status, created) = send(
            &app,
            "POST",
            "/records/budget",
            key,
            &[],
            Some(json!({"payload": {"amount": 100}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["version"], 1);
        let id = created["id"].as_str().unwrap().to_string();
        let uri = format!("/records/budget/{id}");

        let (status, updated) = send(
            &app,
            "PUT",
            &uri,
            key,
            &[("if-match", "\"1\"")],
            Some(json!({"payload": {"amount": 150}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["version"], 2);

        let (status, conflict) = send(
            &app,
            "PUT",
            &uri,
            key,
            &[(VERSION_HEADER, "1")],
            Some(json!({"payload": {"amount": 999}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["error"], "version_conflict");
        assert_eq!(conflict["serverVersion"], 2);
        assert_eq!(conflict["current"]["payload"]["amount"], 150);

        let (status, deleted) = send(&app, "DELETE", &uri, key, &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["version"], 3);
        assert!(deleted["deletedAt"].is_string());

        let (status, feed) = send(
            &app,
            "GET",
            &format!("/state/changes?since={before}"),
            key,
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let budgets = feed["entities"]["budget"].as_array().unwrap();
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0]["id"], id.as_str());
        assert!(budgets[0]["deletedAt"].is_string());
        assert_eq!(feed["has_more"], false);
        assert!(feed["next_cursor"].is_string());
    }

    #[tokio::test]
    async fn test_version_from_body_and_created_status() {
        let (app, _pool, _dir) = app().await;
        let key = Some("acme-key");

        let (status, _) = send(
            &app,
            "PUT",
            "/records/lease/l1",
            key,
            &[],
            Some(json!({"payload": {"unit": "4B"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &app,
            "PUT",
            "/records/lease/l1",
            key,
            &[],
            Some(json!({"version": 5, "payload": {"unit": "4C"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            "PUT",
            "/records/lease/l1",
            key,
            &[],
            Some(json!({"version": 1, "payload": {"unit": "4C"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (app, _pool, _dir) = app().await;
        let key = Some("acme-key");

        let (status, _) = send(&app, "GET", "/records/spaceship/x", key, &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/records/budget/missing", key, &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/records/budget/missing", key, &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "GET", "/state/changes?since=yesterday", key, &[], None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, _) = send(
            &app,
            "PUT",
            "/records/budget/b1",
            key,
            &[("if-match", "abc")],
            Some(json!({"payload": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "PUT",
            "/records/budget/b1",
            key,
            &[],
            Some(json!({"id": "b2", "payload": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_natural_key_is_conflict() {
        let (app, _pool, _dir) = app().await;
        let key = Some("acme-key");

        let body = json!({"payload": {"number": "INV-7"}});
        let (status, _) = send(&app, "POST", "/records/invoice", key, &[], Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, error) = send(&app, "POST", "/records/invoice", key, &[], Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error"], "duplicate_key");
    }

    #[tokio::test]
    async fn test_snapshots_strip_heavy_fields() {
        let (app, _pool, _dir) = app().await;
        let key = Some("acme-key");

        send(
            &app,
            "PUT",
            "/records/invoice/i1",
            key,
            &[],
            Some(json!({"payload": {"number": "INV-1", "pdf_blob": "JVBERi0x"}})),
        )
        .await;

        let (status, bulk) = send(&app, "GET", "/state/bulk?entities=invoice,budget", key, &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bulk.as_object().unwrap().len(), 2);
        assert!(bulk["invoice"][0]["payload"].get("pdf_blob").is_none());

        let (status, chunk) = send(
            &app,
            "GET",
            "/state/bulk-chunked?limit=1&offset=0&entities=invoice",
            key,
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chunk["totals"]["invoice"], 1);
        assert_eq!(chunk["has_more"], false);
        assert!(chunk["next_offset"].is_null());
        assert_eq!(chunk["limit"], 1);
        assert!(chunk["entities"]["invoice"][0]["payload"].get("pdf_blob").is_none());

        let (status, full) = send(&app, "GET", "/records/invoice/i1", key, &[], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(full["payload"]["pdf_blob"], "JVBERi0x");
    }

    #[tokio::test]
    async fn test_tenants_cannot_see_each_other() {
        let (app, _pool, _dir) = app().await;

        send(
            &app,
            "PUT",
            "/records/supplier/s1",
            Some("acme-key"),
            &[],
            Some(json!({"payload": {"name": "Acme Supplies"}})),
        )
        .await;

        let (status, _) = send(&app, "GET", "/records/supplier/s1", Some("globex-key"), &[], None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, bulk) = send(&app, "GET", "/state/bulk", Some("globex-key"), &[], None).await;
        assert!(bulk["supplier"].as_array().unwrap().is_empty());

        let (_, feed) = send(&app, "GET", "/state/changes", Some("globex-key"), &[], None).await;
        assert!(feed["entities"]["supplier"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changes_paginate_with_cursor() {
        let (app, _pool, _dir) = app().await;
        let key = Some("acme-key");
        for n in 0..5 {
            send(
                &app,
                "PUT",
                &format!("/records/payment/p{n}"),
                key,
                &[],
                Some(json!({"payload": {"n": n}})),
            )
            .await;
        }

        let (_, first) = send(&app, "GET", "/state/changes?limit=2&entities=payment", key, &[], None).await;
        assert_eq!(first["entities"]["payment"].as_array().unwrap().len(), 2);
        assert_eq!(first["has_more"], true);

        let mut seen = 2;
        let mut cursor = first["next_cursor"].as_str().unwrap().to_string();
        loop {
            let (status, page) = send(
                &app,
                "GET",
                &format!("/state/changes?limit=2&entities=payment&cursor={cursor}"),
                key,
                &[],
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            seen += page["entities"]["payment"].as_array().unwrap().len();
            cursor = page["next_cursor"].as_str().unwrap().to_string();
            if page["has_more"] == false {
                break;
            }
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn test_expired_cursor_is_gone() {
        let (app, pool, _dir) = app().await;
        sqlx::query("INSERT INTO tombstone_horizons (tenant_id, purged_before) VALUES ('acme', '2024-06-01T00:00:00.000000Z')")
            .execute(&pool)
            .await
            .unwrap();

        let (status, body) = send(
            &app,
            "GET",
            "/state/changes?since=2024-01-01T00:00:00Z",
            Some("acme-key"),
            &[],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["error"], "cursor_expired");
    }
}
