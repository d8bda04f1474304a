mod identity;
mod interceptors;
mod jobs;
mod notifications;
mod projects;
mod queries;
mod stats;
pub mod types;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::CoreResult;

/// The administrative tenant. Its data operations run against the system store itself.
pub const ADMIN_TENANT: &str = "default";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    token_key TEXT NOT NULL UNIQUE,
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_store (
    id TEXT PRIMARY KEY,
    data_store_name TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project (
    id TEXT PRIMARY KEY,
    project_key TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    data_store_name TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_project (
    id TEXT PRIMARY KEY,
    user_email TEXT NOT NULL,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_email, project_id)
);

CREATE TABLE IF NOT EXISTS token (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    token TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    targets TEXT NOT NULL DEFAULT '*',
    mode TEXT NOT NULL DEFAULT 'r',
    user_id TEXT NOT NULL DEFAULT '',
    user_email TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, token)
);

CREATE TABLE IF NOT EXISTS query (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    script TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS local_interceptor (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    target TEXT NOT NULL,
    type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    criteria TEXT NOT NULL DEFAULT '',
    callback TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS remote_interceptor (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    target TEXT NOT NULL,
    type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    method TEXT NOT NULL DEFAULT 'POST',
    url TEXT NOT NULL,
    criteria TEXT NOT NULL DEFAULT '',
    callback TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT 'sql',
    cron TEXT NOT NULL,
    script TEXT NOT NULL,
    loop_script TEXT,
    status TEXT NOT NULL DEFAULT 'stopped',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS push_notification (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    target TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    type TEXT NOT NULL,
    action_type TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL,
    claim_id TEXT,
    claimed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_push_notification_pending
    ON push_notification (status, claim_id, created_at);

CREATE TABLE IF NOT EXISTS user_stats (
    project_id TEXT PRIMARY KEY,
    storage_used INTEGER NOT NULL DEFAULT 0,
    storage_total INTEGER NOT NULL DEFAULT 10737418240,
    http_requests_used INTEGER NOT NULL DEFAULT 0,
    http_requests_total INTEGER NOT NULL DEFAULT 10000000,
    updated_at TEXT NOT NULL
);
";

/// Timestamp format shared by every table. Millisecond precision keeps FIFO order stable.
pub fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Opens a SQLite file with the pragmas every connection in the process uses.
pub fn open_connection(path: &Path) -> CoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// System-wide metadata: users, projects, tokens, queries, interceptor and job
/// definitions, the notification queue and usage stats.
#[derive(Clone)]
pub struct SystemStore {
    db: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SystemStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| crate::core::error::CoreError::Internal(e.to_string()))?;
            }
        }
        let conn = open_connection(&path)?;
        conn.execute_batch(SCHEMA)?;
        info!("System store ready at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// File backing the store. A second connection to it serves the administrative tenant.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> (SystemStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SystemStore::open(dir.path().join("system.db")).await.unwrap();
    (store, dir)
}
