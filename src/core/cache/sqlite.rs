use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::CacheStore;
use crate::core::error::CoreResult;
use crate::core::store::{now_ts, open_connection};

/// Cache kept in its own SQLite file. Every instance opening the same file shares
/// entries and sees deletes immediately.
#[derive(Clone)]
pub struct SqliteCache {
    db: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = open_connection(path.as_ref())?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let db = self.db.lock().await;
        let value = db
            .query_row(
                "SELECT value FROM kv_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO kv_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ts()],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> CoreResult<usize> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM kv_cache WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(deleted)
    }
}
