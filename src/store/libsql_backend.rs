//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every operation is a single
//! SQL statement, so conditional writes are atomic with respect to each other.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, Entry};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Absolute expiry in unix millis for an optional TTL.
fn expiry_value(ttl: Option<Duration>) -> libsql::Value {
    match ttl {
        Some(ttl) => {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            libsql::Value::Integer(now_millis().saturating_add(ttl_ms))
        }
        None => libsql::Value::Null,
    }
}

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when no such key exists (empty prefix or all `0xFF` bytes).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

fn row_to_entry(row: &libsql::Row) -> Result<Entry, libsql::Error> {
    Ok(Entry {
        key: row.get::<Vec<u8>>(0)?,
        value: row.get::<Vec<u8>>(1)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key.to_vec(), now_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: Vec<u8> = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get row parse: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
        }
    }

    async fn set(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO kv (key, value, expires_at, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![
                    key.to_vec(),
                    value.to_vec(),
                    expiry_value(ttl),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set: {e}")))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, DatabaseError> {
        // The conflict branch only fires for an expired row, so a live key is
        // never overwritten and the statement reports zero changes.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO kv (key, value, expires_at, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                 WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?5",
                params![
                    key.to_vec(),
                    value.to_vec(),
                    expiry_value(ttl),
                    Utc::now().to_rfc3339(),
                    now_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_if_absent: {e}")))?;

        debug!(created = changed > 0, "put_if_absent");
        Ok(changed > 0)
    }

    async fn compare_and_swap(
        &self,
        key: &[u8],
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE kv SET value = ?3, updated_at = ?4
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?5)",
                params![
                    key.to_vec(),
                    expected.to_vec(),
                    new.to_vec(),
                    Utc::now().to_rfc3339(),
                    now_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key.to_vec()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_if(&self, key: &[u8], expected: &[u8]) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2",
                params![key.to_vec(), expected.to_vec()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_if: {e}")))?;
        Ok(changed > 0)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match prefix_upper_bound(prefix) {
            Some(upper) => conn
                .query(
                    "SELECT key, value FROM kv
                     WHERE key >= ?1 AND key < ?2 AND (expires_at IS NULL OR expires_at > ?3)
                     ORDER BY key ASC",
                    params![prefix.to_vec(), upper, now_millis()],
                )
                .await,
            None => conn
                .query(
                    "SELECT key, value FROM kv
                     WHERE key >= ?1 AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY key ASC",
                    params![prefix.to_vec(), now_millis()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("scan_prefix: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("scan_prefix: {e}")))?
        {
            let entry =
                row_to_entry(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn purge_expired(&self) -> Result<usize, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired: {e}")))?;

        if removed > 0 {
            info!(count = removed, "Purged expired keys");
        }
        Ok(removed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn set_and_get() {
        let db = test_db().await;
        db.set(b"a/1", b"one", None).await.unwrap();
        assert_eq!(db.get(b"a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(db.get(b"a/2").await.unwrap(), None);

        db.set(b"a/1", b"uno", None).await.unwrap();
        assert_eq!(db.get(b"a/1").await.unwrap(), Some(b"uno".to_vec()));
    }

    #[tokio::test]
    async fn put_if_absent_first_writer_wins() {
        let db = test_db().await;
        assert!(db.put_if_absent(b"claim", b"first", None).await.unwrap());
        assert!(!db.put_if_absent(b"claim", b"second", None).await.unwrap());
        assert_eq!(db.get(b"claim").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn put_if_absent_concurrent_claims() {
        let db = Arc::new(test_db().await);
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.put_if_absent(b"race", &[i], None).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_keys_are_absent() {
        let db = test_db().await;
        db.set(b"ttl", b"v", Some(Duration::from_millis(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(db.get(b"ttl").await.unwrap(), None);
        assert!(db.scan_prefix(b"tt").await.unwrap().is_empty());
        // An expired key can be claimed again.
        assert!(db.put_if_absent(b"ttl", b"fresh", None).await.unwrap());
        assert_eq!(db.get(b"ttl").await.unwrap(), Some(b"fresh".to_vec()));
    }

    #[tokio::test]
    async fn purge_expired_removes_rows() {
        let db = test_db().await;
        db.set(b"old", b"v", Some(Duration::from_millis(1))).await.unwrap();
        db.set(b"keep", b"v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(db.purge_expired().await.unwrap(), 1);
        assert_eq!(db.purge_expired().await.unwrap(), 0);
        assert!(db.get(b"keep").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compare_and_swap_requires_expected_value() {
        let db = test_db().await;
        db.set(b"k", b"v1", None).await.unwrap();
        assert!(!db.compare_and_swap(b"k", b"nope", b"v2").await.unwrap());
        assert!(db.compare_and_swap(b"k", b"v1", b"v2").await.unwrap());
        assert_eq!(db.get(b"k").await.unwrap(), Some(b"v2".to_vec()));
        assert!(!db.compare_and_swap(b"missing", b"v1", b"v2").await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_delete_if() {
        let db = test_db().await;
        db.set(b"k", b"v", None).await.unwrap();
        assert!(!db.delete_if(b"k", b"other").await.unwrap());
        assert!(db.delete_if(b"k", b"v").await.unwrap());
        assert!(!db.delete(b"k").await.unwrap());

        db.set(b"k2", b"v", None).await.unwrap();
        assert!(db.delete(b"k2").await.unwrap());
        assert_eq!(db.get(b"k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_is_bounded_and_ordered() {
        let db = test_db().await;
        db.set(b"delivery/1:5/20", b"b", None).await.unwrap();
        db.set(b"delivery/1:5/10", b"a", None).await.unwrap();
        db.set(b"delivery/1:50/10", b"x", None).await.unwrap();
        db.set(b"delivery/1:6/10", b"y", None).await.unwrap();
        db.set(b"rule/1/a", b"z", None).await.unwrap();

        let entries = db.scan_prefix(b"delivery/1:5/").await.unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"delivery/1:5/10"[..], &b"delivery/1:5/20"[..]]);

        assert_eq!(db.scan_prefix(b"delivery/").await.unwrap().len(), 4);
        assert_eq!(db.scan_prefix(b"").await.unwrap().len(), 5);
    }

    #[test]
    fn upper_bound_handles_max_bytes() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x61, 0xFF]), Some(vec![0x62]));
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_upper_bound(b""), None);
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("relay.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.set(b"k", b"v", None).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.run_migrations().await.unwrap();
    }
}
