use rusqlite::{OptionalExtension, params};

use super::types::{DEFAULT_HTTP_REQUESTS_TOTAL, DEFAULT_STORAGE_TOTAL, UsageStats};
use super::{SystemStore, now_ts};
use crate::core::error::CoreResult;

impl SystemStore {
    /// Usage for one tenant. A tenant without a row gets the default quotas.
    pub async fn load_stats(&self, project_id: &str) -> CoreResult<UsageStats> {
        let db = self.db.lock().await;
        let stats = db
            .query_row(
                "SELECT project_id, storage_used, storage_total, http_requests_used, http_requests_total
                 FROM user_stats WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok(UsageStats {
                        project_id: row.get(0)?,
                        storage_used: row.get(1)?,
                        storage_total: row.get(2)?,
                        http_requests_used: row.get(3)?,
                        http_requests_total: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(stats.unwrap_or_else(|| UsageStats::with_defaults(project_id)))
    }

    /// Usage for every active project, defaults filled in.
    pub async fn list_stats(&self) -> CoreResult<Vec<UsageStats>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT project.id,
                    COALESCE(user_stats.storage_used, 0),
                    COALESCE(user_stats.storage_total, ?1),
                    COALESCE(user_stats.http_requests_used, 0),
                    COALESCE(user_stats.http_requests_total, ?2)
             FROM project LEFT JOIN user_stats ON user_stats.project_id = project.id
             WHERE project.status = 0",
        )?;
        let rows = stmt.query_map(
            params![DEFAULT_STORAGE_TOTAL, DEFAULT_HTTP_REQUESTS_TOTAL],
            |row| {
                Ok(UsageStats {
                    project_id: row.get(0)?,
                    storage_used: row.get(1)?,
                    storage_total: row.get(2)?,
                    http_requests_used: row.get(3)?,
                    http_requests_total: row.get(4)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn record_request(&self, project_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO user_stats (project_id, storage_used, storage_total, http_requests_used, http_requests_total, updated_at)
             VALUES (?1, 0, ?2, 1, ?3, ?4)
             ON CONFLICT(project_id) DO UPDATE SET
                http_requests_used = http_requests_used + 1,
                updated_at = excluded.updated_at",
            params![project_id, DEFAULT_STORAGE_TOTAL, DEFAULT_HTTP_REQUESTS_TOTAL, now_ts()],
        )?;
        Ok(())
    }
}
