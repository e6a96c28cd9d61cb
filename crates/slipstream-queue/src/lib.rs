//! # Slipstream Queue
//!
//! Durable, ordered storage for mutating requests captured while the
//! network was unreachable.
//!
//! ## Features
//!
//! - **RecordStore**: explicit async storage interface (get, getAll, add,
//!   put, delete) implemented per platform
//! - **MemoryStore**: in-memory backend for tests and ephemeral workers
//! - **SqliteStore**: crash-safe backend on SQLite
//! - **DurableQueue**: timestamp-keyed capture with one-shot body
//!   materialization at the enqueue boundary
//!
//! ## Architecture
//!
//! ```text
//! DurableQueue
//!     └── dyn RecordStore
//!             ├── MemoryStore (BTreeMap)
//!             └── SqliteStore (queued_requests table)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use slipstream_common::unix_time_ms;
use slipstream_fetch::{CredentialsMode, FetchError, Request, RequestBody, RequestMode};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

pub mod sqlite;

pub use sqlite::SqliteStore;

// ==================== Errors ====================

/// Errors that can occur in queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key already exists: {0}")]
    KeyExists(u64),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Body capture failed: {0}")]
    BodyCapture(#[from] FetchError),
}

// ==================== Queued request ====================

/// A mutating request captured for later replay.
///
/// The body is always a fully materialized buffer: a live stream cannot be
/// read twice, so it is drained exactly once before the enqueue is
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Capture timestamp in ms; unique key within the queue.
    pub queued_at: u64,
    pub url: String,
    pub method: String,
    /// Headers serialized to a plain mapping.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
    /// Failed replay attempts so far.
    pub retries: u32,
}

impl QueuedRequest {
    /// Capture a request, draining any streamed body into the record.
    pub async fn capture(mut request: Request, queued_at: u64) -> Result<Self, QueueError> {
        let body = request.materialize_body().await?.to_vec();

        let headers = request
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            queued_at,
            url: request.url.to_string(),
            method: request.method.to_string(),
            headers,
            body,
            credentials: request.credentials,
            mode: request.mode,
            retries: 0,
        })
    }

    /// Rebuild a replayable request from this record.
    pub fn to_request(&self) -> Result<Request, QueueError> {
        let url = Url::parse(&self.url)
            .map_err(|e| QueueError::InvalidRecord(format!("url {}: {}", self.url, e)))?;
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| QueueError::InvalidRecord(format!("method {}: {}", self.method, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| QueueError::InvalidRecord(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| QueueError::InvalidRecord(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }

        let mut request = Request::get(url);
        request.method = method;
        request.headers = headers;
        request.body = if self.body.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Buffered(self.body.clone().into())
        };
        request.credentials = self.credentials;
        request.mode = self.mode;
        Ok(request)
    }
}

// ==================== RecordStore ====================

/// Explicit async storage interface for queued requests.
///
/// The handful of operations actually needed, implemented per platform;
/// `get_all` returns records in ascending key order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: u64) -> Result<Option<QueuedRequest>, QueueError>;

    async fn get_all(&self) -> Result<Vec<QueuedRequest>, QueueError>;

    /// Insert a record; fails with [`QueueError::KeyExists`] when the key
    /// is taken.
    async fn add(&self, record: &QueuedRequest) -> Result<(), QueueError>;

    /// Insert or overwrite a record.
    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError>;

    async fn delete(&self, key: u64) -> Result<bool, QueueError>;

    async fn count(&self) -> Result<usize, QueueError>;
}

// ==================== MemoryStore ====================

/// In-memory record store ordered by capture timestamp.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<u64, QueuedRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: u64) -> Result<Option<QueuedRequest>, QueueError> {
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn get_all(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn add(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.queued_at) {
            return Err(QueueError::KeyExists(record.queued_at));
        }
        records.insert(record.queued_at, record.clone());
        Ok(())
    }

    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        self.records
            .write()
            .await
            .insert(record.queued_at, record.clone());
        Ok(())
    }

    async fn delete(&self, key: u64) -> Result<bool, QueueError> {
        Ok(self.records.write().await.remove(&key).is_some())
    }

    async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.records.read().await.len())
    }
}

// ==================== DurableQueue ====================

/// The offline request queue.
///
/// Entries are keyed by capture timestamp; a key collision bumps the
/// timestamp forward until a free slot is found, so two captures in the
/// same millisecond stay distinguishable.
pub struct DurableQueue {
    store: Arc<dyn RecordStore>,
}

impl DurableQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Capture a request under the current wall-clock timestamp.
    pub async fn enqueue(&self, request: Request) -> Result<u64, QueueError> {
        self.enqueue_at(request, unix_time_ms()).await
    }

    /// Capture a request under an explicit timestamp key.
    pub async fn enqueue_at(&self, request: Request, at_ms: u64) -> Result<u64, QueueError> {
        let mut record = QueuedRequest::capture(request, at_ms).await?;

        loop {
            match self.store.add(&record).await {
                Ok(()) => {
                    info!(
                        key = record.queued_at,
                        url = %record.url,
                        method = %record.method,
                        "request queued for replay"
                    );
                    return Ok(record.queued_at);
                }
                Err(QueueError::KeyExists(taken)) => {
                    debug!(key = taken, "timestamp key taken, bumping");
                    record.queued_at = taken + 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All pending records, oldest first.
    pub async fn all(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        self.store.get_all().await
    }

    /// Remove a replayed record.
    pub async fn remove(&self, key: u64) -> Result<bool, QueueError> {
        self.store.delete(key).await
    }

    /// Record a failed replay attempt, keeping the entry for next time.
    pub async fn record_failure(&self, mut record: QueuedRequest) -> Result<(), QueueError> {
        record.retries += 1;
        self.store.put(&record).await
    }

    /// Number of pending records.
    pub async fn len(&self) -> Result<usize, QueueError> {
        self.store.count().await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.store.count().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn post(path: &str, body: &'static [u8]) -> Request {
        Request::post(url(&format!("https://example.com{}", path)), Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_capture_roundtrip() {
        let request = post("/api/save", b"{\"title\":\"x\"}")
            .header(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("application/json"),
            )
            .credentials(CredentialsMode::Include);

        let record = QueuedRequest::capture(request, 1_000).await.unwrap();
        assert_eq!(record.queued_at, 1_000);
        assert_eq!(record.method, "POST");
        assert_eq!(record.body, b"{\"title\":\"x\"}");
        assert_eq!(record.credentials, CredentialsMode::Include);

        let rebuilt = record.to_request().unwrap();
        assert_eq!(rebuilt.method, Method::POST);
        assert_eq!(rebuilt.url.as_str(), "https://example.com/api/save");
        assert_eq!(
            rebuilt.headers.get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(rebuilt.credentials, CredentialsMode::Include);
    }

    #[tokio::test]
    async fn test_capture_drains_stream_body() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"chunk-a"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"chunk-b"))).await.unwrap();
        drop(tx);

        let request = Request::streaming(url("https://example.com/api/save"), Method::POST, rx);
        let record = QueuedRequest::capture(request, 7).await.unwrap();
        assert_eq!(record.body, b"chunk-achunk-b");
    }

    #[tokio::test]
    async fn test_memory_store_ordering() {
        let store = MemoryStore::new();
        for key in [30_u64, 10, 20] {
            let record = QueuedRequest::capture(post("/api/save", b"{}"), key)
                .await
                .unwrap();
            store.add(&record).await.unwrap();
        }

        let keys: Vec<u64> = store
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.queued_at)
            .collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_memory_store_add_rejects_duplicates() {
        let store = MemoryStore::new();
        let record = QueuedRequest::capture(post("/api/save", b"{}"), 5)
            .await
            .unwrap();
        store.add(&record).await.unwrap();

        let result = store.add(&record).await;
        assert!(matches!(result, Err(QueueError::KeyExists(5))));
    }

    #[tokio::test]
    async fn test_enqueue_bumps_colliding_keys() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));

        let first = queue.enqueue_at(post("/a", b"1"), 100).await.unwrap();
        let second = queue.enqueue_at(post("/b", b"2"), 100).await.unwrap();

        assert_eq!(first, 100);
        assert_eq!(second, 101);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_record_failure() {
        let queue = DurableQueue::new(Arc::new(MemoryStore::new()));
        let key = queue.enqueue_at(post("/a", b"1"), 100).await.unwrap();

        let mut entries = queue.all().await.unwrap();
        assert_eq!(entries.len(), 1);

        let entry = entries.pop().unwrap();
        queue.record_failure(entry).await.unwrap();

        let entries = queue.all().await.unwrap();
        assert_eq!(entries[0].retries, 1);

        assert!(queue.remove(key).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
        assert!(!queue.remove(key).await.unwrap());
    }
}
