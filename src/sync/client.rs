//! HTTP + WebSocket client for the sync server.
//!
//! Cold start loads a chunked snapshot; afterwards the replica is kept
//! current by pulling the change feed with the stored cursor, and realtime
//! events are applied eagerly in between. Writes follow the optimistic
//! protocol: read, write with the read version, and on 409 read again and
//! re-apply the change.

use chrono::{DateTime, Duration, Utc};
use futures::{SinkExt, StreamExt};
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::replica::{Applied, Replica, ReplicaError};
use crate::config::Config;
use crate::models::{now, ChangeEvent, EventType, FeedCursor, Record};
use crate::server::{ChangesResponse, ChunkResponse};

/// Feed origin is moved back by this much behind the snapshot read time to
/// cover writes that committed while the snapshot was being read.
const SNAPSHOT_OVERLAP_SECS: i64 = 5;

/// Snapshot attempts before accepting one whose totals moved mid-read.
const SNAPSHOT_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SyncClientError {
    #[error("Sync not configured. Add server_url and api_key to config.")]
    NotConfigured,
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status} ({error}): {message}")]
    Server {
        status: u16,
        error: String,
        message: String,
    },
    #[error("{kind}/{id} not found")]
    NotFound { kind: String, id: String },
    #[error("Gave up on {kind}/{id} after {attempts} version conflict(s)")]
    ConflictRetriesExhausted {
        kind: String,
        id: String,
        attempts: u32,
    },
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(rename = "serverVersion", default)]
    server_version: Option<i64>,
    /// Purge horizon of an expired cursor.
    #[serde(default)]
    horizon: Option<DateTime<Utc>>,
}

/// Identity behind the configured API key.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub tenant_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub records: usize,
    pub pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub pages: usize,
    /// The cursor had expired (or was missing) and a snapshot was loaded.
    pub reloaded: bool,
}

pub struct SyncClient {
    http: reqwest::Client,
    server_url: String,
    api_key: String,
    page_size: usize,
    max_retries: u32,
}

impl SyncClient {
    /// Creates a new sync client from config.
    ///
    /// Returns an error if sync is not configured.
    pub fn from_config(config: &Config) -> Result<Self, SyncClientError> {
        let server_url = config
            .server_url
            .clone()
            .ok_or(SyncClientError::NotConfigured)?;
        let api_key = config
            .api_key
            .clone()
            .ok_or(SyncClientError::NotConfigured)?;

        Ok(Self::new(server_url, api_key)
            .with_page_size(config.page_size)
            .with_max_retries(config.max_retries))
    }

    /// Creates a new sync client with explicit parameters.
    pub fn new(server_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key,
            page_size: 500,
            max_retries: 3,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.http_base(), path))
            .bearer_auth(&self.api_key)
    }

    fn http_base(&self) -> String {
        if let Some(rest) = self.server_url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        }
    }

    /// Builds the realtime WebSocket URL.
    fn ws_url(&self) -> String {
        let base = self.http_base();
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base
        };

        format!("{}/realtime?api_key={}", base, urlencoding::encode(&self.api_key))
    }

    fn record_path(kind: &str, id: &str) -> String {
        format!(
            "/records/{}/{}",
            urlencoding::encode(kind),
            urlencoding::encode(id)
        )
    }

    async fn server_error(response: Response) -> SyncClientError {
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => SyncClientError::Server {
                status: status.as_u16(),
                error: body.error,
                message: body.message,
            },
            Err(_) => SyncClientError::Server {
                status: status.as_u16(),
                error: "unknown".to_string(),
                message: status.canonical_reason().unwrap_or("error").to_string(),
            },
        }
    }

    async fn read_record(response: Response) -> Result<Record, SyncClientError> {
        if !response.status().is_success() {
            return Err(Self::server_error(response).await);
        }
        Ok(response.json().await?)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Replaces the replica with a fresh chunked snapshot.
    pub async fn snapshot(&self, replica: &mut Replica) -> Result<SnapshotSummary, SyncClientError> {
        self.reload(replica, None).await
    }

    /// Loads a snapshot and starts the feed at its read time, minus the
    /// overlap but never before `floor`.
    async fn reload(
        &self,
        replica: &mut Replica,
        floor: Option<DateTime<Utc>>,
    ) -> Result<SnapshotSummary, SyncClientError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (entities, origin, pages, stable) = self.read_snapshot().await?;

            if !stable && attempt < SNAPSHOT_ATTEMPTS {
                tracing::info!("Records changed during snapshot, reloading");
                continue;
            }

            let mut since = origin - Duration::seconds(SNAPSHOT_OVERLAP_SECS);
            if let Some(floor) = floor {
                since = since.max(floor);
            }
            replica.replace_all(entities, FeedCursor::from_since(since).encode(), since);

            return Ok(SnapshotSummary {
                records: replica.len(),
                pages,
            });
        }
    }

    /// Reads every chunk. `stable` is false if per-kind totals moved between
    /// the first and last page, in which case offsets may have shifted.
    async fn read_snapshot(
        &self,
    ) -> Result<(BTreeMap<String, Vec<Record>>, DateTime<Utc>, usize, bool), SyncClientError>
    {
        let mut entities: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let mut first_totals = None;
        let mut last_totals = None;
        let mut origin = None;
        let mut offset = 0;
        let mut pages = 0;

        loop {
            let path = format!("/state/bulk-chunked?limit={}&offset={}", self.page_size, offset);
            let response = self.request(Method::GET, &path).send().await?;
            if !response.status().is_success() {
                return Err(Self::server_error(response).await);
            }
            let page: ChunkResponse = response.json().await?;
            pages += 1;

            origin.get_or_insert(page.loaded_at);
            first_totals.get_or_insert_with(|| page.totals.clone());
            last_totals = Some(page.totals);

            for (kind, records) in page.entities {
                entities.entry(kind).or_default().extend(records);
            }

            match page.next_offset {
                Some(next) if page.has_more => offset = next,
                _ => break,
            }
        }

        let stable = first_totals == last_totals;
        Ok((entities, origin.unwrap_or_else(now), pages, stable))
    }

    /// Pulls the change feed until caught up.
    ///
    /// Loads a snapshot instead when the replica has no cursor yet or the
    /// server reports the cursor as expired.
    pub async fn pull(&self, replica: &mut Replica) -> Result<PullSummary, SyncClientError> {
        let Some(mut cursor) = replica.cursor.clone() else {
            let snapshot = self.snapshot(replica).await?;
            return Ok(PullSummary {
                updated: snapshot.records,
                pages: snapshot.pages,
                reloaded: true,
                ..Default::default()
            });
        };

        let mut summary = PullSummary::default();
        loop {
            let path = format!(
                "/state/changes?limit={}&cursor={}",
                self.page_size,
                urlencoding::encode(&cursor)
            );
            let response = self.request(Method::GET, &path).send().await?;

            if response.status() == StatusCode::GONE {
                let body: ErrorBody = response.json().await?;
                tracing::info!(
                    "Change feed cursor expired (horizon {:?}), reloading snapshot",
                    body.horizon
                );
                let snapshot = self.reload(replica, body.horizon).await?;
                summary.updated += snapshot.records;
                summary.pages += snapshot.pages;
                summary.reloaded = true;
                return Ok(summary);
            }
            if !response.status().is_success() {
                return Err(Self::server_error(response).await);
            }

            let page: ChangesResponse = response.json().await?;
            summary.pages += 1;

            for record in page.entities.into_values().flatten() {
                match replica.apply(record) {
                    Applied::Inserted | Applied::Updated => summary.updated += 1,
                    Applied::Removed => summary.removed += 1,
                    Applied::Stale => summary.unchanged += 1,
                }
            }

            cursor = page.next_cursor;
            replica.cursor = Some(cursor.clone());

            if !page.has_more {
                break;
            }
        }

        Ok(summary)
    }

    /// Checks the API key and returns the tenant it belongs to.
    pub async fn whoami(&self) -> Result<Identity, SyncClientError> {
        let response = self.request(Method::GET, "/me").send().await?;
        if !response.status().is_success() {
            return Err(Self::server_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetches one record in full, or `None` if it doesn't exist.
    pub async fn fetch(&self, kind: &str, id: &str) -> Result<Option<Record>, SyncClientError> {
        let response = self
            .request(Method::GET, &Self::record_path(kind, id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_record(response).await.map(Some)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Creates a record with a server-generated id.
    pub async fn create(
        &self,
        replica: &mut Replica,
        kind: &str,
        payload: Map<String, Value>,
    ) -> Result<Record, SyncClientError> {
        let response = self
            .request(Method::POST, &format!("/records/{}", urlencoding::encode(kind)))
            .json(&json!({ "payload": payload }))
            .send()
            .await?;

        let record = Self::read_record(response).await?;
        replica.apply(record.clone());
        Ok(record)
    }

    /// Sets `changes` on top of the record's current payload.
    ///
    /// Each attempt reads the current record and writes with its version; a
    /// version conflict starts over from a fresh read.
    pub async fn put(
        &self,
        replica: &mut Replica,
        kind: &str,
        id: &str,
        changes: Map<String, Value>,
    ) -> Result<Record, SyncClientError> {
        let path = Self::record_path(kind, id);
        let attempts = self.max_retries + 1;

        for attempt in 1..=attempts {
            let current = self.fetch(kind, id).await?;
            let (expected, base) = match current {
                Some(record) => {
                    let version = record.version;
                    let payload = record.payload.clone();
                    replica.apply(record);
                    (Some(version), payload)
                }
                None => (None, Value::Object(Map::new())),
            };
            let payload = merge(base, &changes);

            let mut request = self
                .request(Method::PUT, &path)
                .json(&json!({ "payload": payload }));
            if let Some(version) = expected {
                request = request.header(header::IF_MATCH, format!("\"{version}\""));
            }
            let response = request.send().await?;

            if response.status() == StatusCode::CONFLICT {
                let body: ErrorBody = response.json().await?;
                if body.error != "version_conflict" {
                    return Err(SyncClientError::Server {
                        status: StatusCode::CONFLICT.as_u16(),
                        error: body.error,
                        message: body.message,
                    });
                }
                tracing::info!(
                    "Version conflict on {}/{} (attempt {}/{}, server at {:?}), retrying",
                    kind,
                    id,
                    attempt,
                    attempts,
                    body.server_version
                );
                continue;
            }

            let record = Self::read_record(response).await?;
            replica.apply(record.clone());
            return Ok(record);
        }

        Err(SyncClientError::ConflictRetriesExhausted {
            kind: kind.to_string(),
            id: id.to_string(),
            attempts,
        })
    }

    /// Soft-deletes a record, retrying on version conflicts.
    pub async fn delete(
        &self,
        replica: &mut Replica,
        kind: &str,
        id: &str,
    ) -> Result<Record, SyncClientError> {
        let path = Self::record_path(kind, id);
        let attempts = self.max_retries + 1;

        for attempt in 1..=attempts {
            let mut request = self.request(Method::DELETE, &path);
            if let Some(local) = replica.get(kind, id) {
                request = request.header(header::IF_MATCH, format!("\"{}\"", local.version));
            }
            let response = request.send().await?;

            match response.status() {
                StatusCode::NOT_FOUND => {
                    return Err(SyncClientError::NotFound {
                        kind: kind.to_string(),
                        id: id.to_string(),
                    })
                }
                StatusCode::CONFLICT => {
                    tracing::info!(
                        "Version conflict deleting {}/{} (attempt {}/{}), refetching",
                        kind,
                        id,
                        attempt,
                        attempts
                    );
                    if let Some(fresh) = self.fetch(kind, id).await? {
                        replica.apply(fresh);
                    }
                    continue;
                }
                _ => {}
            }

            let record = Self::read_record(response).await?;
            replica.apply(record.clone());
            return Ok(record);
        }

        Err(SyncClientError::ConflictRetriesExhausted {
            kind: kind.to_string(),
            id: id.to_string(),
            attempts,
        })
    }

    // ========================================================================
    // Realtime
    // ========================================================================

    /// Streams realtime events into the replica until the server closes the
    /// connection. `on_event` runs after each event has been applied.
    pub async fn watch<F>(&self, replica: &mut Replica, mut on_event: F) -> Result<(), SyncClientError>
    where
        F: FnMut(&Replica, &ChangeEvent),
    {
        let (ws_stream, _) = connect_async(self.ws_url())
            .await
            .map_err(|e| SyncClientError::WebSocket(e.to_string()))?;
        let (mut sender, mut receiver) = ws_stream.split();

        // Catch up only after subscribing, so nothing falls in between.
        self.pull(replica).await?;

        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let event: ChangeEvent = match serde_json::from_str(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!("Ignoring malformed event: {}", e);
                            continue;
                        }
                    };

                    match event.event_type {
                        EventType::Resync => {
                            self.pull(replica).await?;
                        }
                        EventType::RecordUpserted | EventType::RecordDeleted => {
                            if let Some(record) = event.record() {
                                replica.apply(record);
                            }
                        }
                    }
                    on_event(replica, &event);
                }
                Ok(Message::Ping(data)) => {
                    sender
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SyncClientError::WebSocket(e.to_string()))?;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(SyncClientError::WebSocket(e.to_string())),
            }
        }

        Ok(())
    }
}

/// Shallow-merges `changes` into `base`. A `null` change removes the field.
fn merge(base: Value, changes: &Map<String, Value>) -> Value {
    let mut map = match base {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in changes {
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.clone(), value.clone());
        }
    }
    Value::Object(map)
}
