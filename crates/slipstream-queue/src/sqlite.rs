//! SQLite-backed record store.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use crate::{QueueError, QueuedRequest, RecordStore};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

fn storage_err(e: rusqlite::Error) -> QueueError {
    QueueError::Storage(e.to_string())
}

/// Crash-safe record store on SQLite.
///
/// Records are serialized to JSON and keyed by capture timestamp; the
/// primary key gives both uniqueness and replay ordering.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store; contents die with the handle.
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("queue connection poisoned")
    }
}

fn init_schema(conn: &Connection) -> Result<(), QueueError> {
    let version: i32 = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or(None)
        .unwrap_or(0);

    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queued_requests (
            queued_at INTEGER PRIMARY KEY,
            record TEXT NOT NULL
        );
        "#,
    )
    .map_err(storage_err)?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        params![SCHEMA_VERSION],
    )
    .map_err(storage_err)?;

    debug!(version = SCHEMA_VERSION, "queue schema initialized");
    Ok(())
}

fn decode(record: String) -> Result<QueuedRequest, QueueError> {
    Ok(serde_json::from_str(&record)?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, key: u64) -> Result<Option<QueuedRequest>, QueueError> {
        let conn = self.lock();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM queued_requests WHERE queued_at = ?",
                params![key as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        record.map(decode).transpose()
    }

    async fn get_all(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT record FROM queued_requests ORDER BY queued_at ASC")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        rows.into_iter().map(decode).collect()
    }

    async fn add(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(record)?;
        let conn = self.lock();

        match conn.execute(
            "INSERT INTO queued_requests (queued_at, record) VALUES (?, ?)",
            params![record.queued_at as i64, encoded],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::KeyExists(record.queued_at))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn put(&self, record: &QueuedRequest) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(record)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO queued_requests (queued_at, record) VALUES (?, ?)",
                params![record.queued_at as i64, encoded],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: u64) -> Result<bool, QueueError> {
        let deleted = self
            .lock()
            .execute(
                "DELETE FROM queued_requests WHERE queued_at = ?",
                params![key as i64],
            )
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn count(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM queued_requests", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipstream_fetch::{CredentialsMode, RequestMode};

    fn record(key: u64) -> QueuedRequest {
        QueuedRequest {
            queued_at: key,
            url: "https://example.com/api/save".to_string(),
            method: "POST".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: b"{\"n\":1}".to_vec(),
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let store = SqliteStore::in_memory().unwrap();

        store.add(&record(100)).await.unwrap();
        let loaded = store.get(100).await.unwrap().unwrap();
        assert_eq!(loaded, record(100));

        assert!(store.delete(100).await.unwrap());
        assert!(store.get(100).await.unwrap().is_none());
        assert!(!store.delete(100).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_keys() {
        let store = SqliteStore::in_memory().unwrap();
        store.add(&record(100)).await.unwrap();

        let result = store.add(&record(100)).await;
        assert!(matches!(result, Err(QueueError::KeyExists(100))));
    }

    #[tokio::test]
    async fn test_get_all_ordered() {
        let store = SqliteStore::in_memory().unwrap();
        for key in [300_u64, 100, 200] {
            store.add(&record(key)).await.unwrap();
        }

        let keys: Vec<u64> = store
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.queued_at)
            .collect();
        assert_eq!(keys, vec![100, 200, 300]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = SqliteStore::in_memory().unwrap();
        store.add(&record(100)).await.unwrap();

        let mut updated = record(100);
        updated.retries = 3;
        store.put(&updated).await.unwrap();

        let loaded = store.get(100).await.unwrap().unwrap();
        assert_eq!(loaded.retries, 3);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.add(&record(100)).await.unwrap();
            store.add(&record(200)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        let loaded = store.get(200).await.unwrap().unwrap();
        assert_eq!(loaded.url, "https://example.com/api/save");
    }
}
