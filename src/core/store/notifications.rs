use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::types::{NewNotification, NotificationRecord, NotificationStatus};
use super::{SystemStore, new_id, now_ts};
use crate::core::error::CoreResult;

const NOTIFICATION_COLUMNS: &str = "id, project_id, target, method, url, type, action_type, status, data, claim_id, created_at, updated_at";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        target: row.get(2)?,
        method: row.get(3)?,
        url: row.get(4)?,
        phase: row.get(5)?,
        action: row.get(6)?,
        status: row.get(7)?,
        data: row.get(8)?,
        claim_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl SystemStore {
    pub async fn enqueue_notification(&self, notification: &NewNotification) -> CoreResult<String> {
        let id = new_id();
        let data = serde_json::to_string(&notification.data)?;
        let now = now_ts();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO push_notification
             (id, project_id, target, method, url, type, action_type, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?9)",
            params![
                id,
                notification.project_id,
                notification.target,
                notification.method,
                notification.url,
                notification.phase.as_str(),
                notification.action,
                data,
                now
            ],
        )?;
        Ok(id)
    }

    /// Stamps up to `limit` unclaimed pending rows with `claim_id`, oldest first.
    /// A single UPDATE, so concurrent rounds in any process never share a row.
    pub async fn claim_notifications(&self, claim_id: &str, limit: usize) -> CoreResult<usize> {
        let now = now_ts();
        let db = self.db.lock().await;
        let claimed = db.execute(
            "UPDATE push_notification SET claim_id = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id IN (
                SELECT id FROM push_notification
                WHERE status = 0 AND claim_id IS NULL
                ORDER BY created_at, id
                LIMIT ?3
             )",
            params![claim_id, now, limit as i64],
        )?;
        Ok(claimed)
    }

    pub async fn claimed_notifications(&self, claim_id: &str) -> CoreResult<Vec<NotificationRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM push_notification WHERE claim_id = ?1 AND status = 0 ORDER BY created_at, id",
            NOTIFICATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![claim_id], notification_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Moves pending rows to a terminal status in one statement. Rows already terminal are untouched.
    pub async fn mark_notifications(
        &self,
        ids: &[String],
        status: NotificationStatus,
    ) -> CoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE push_notification SET status = ?, updated_at = ?
             WHERE status = 0 AND id IN ({})",
            placeholders
        );

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + 2);
        values.push(status.code().into());
        values.push(now_ts().into());
        values.extend(ids.iter().cloned().map(rusqlite::types::Value::from));

        let db = self.db.lock().await;
        let updated = db.execute(&sql, params_from_iter(values))?;
        Ok(updated)
    }

    /// Fails rows claimed before `cutoff` that never reached a terminal status.
    pub async fn reap_stale_claims(&self, cutoff: &str) -> CoreResult<usize> {
        let db = self.db.lock().await;
        let reaped = db.execute(
            "UPDATE push_notification SET status = 1, updated_at = ?1
             WHERE status = 0 AND claim_id IS NOT NULL AND claimed_at < ?2",
            params![now_ts(), cutoff],
        )?;
        Ok(reaped)
    }

    pub async fn find_notification(&self, id: &str) -> CoreResult<Option<NotificationRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                &format!(
                    "SELECT {} FROM push_notification WHERE id = ?1",
                    NOTIFICATION_COLUMNS
                ),
                params![id],
                notification_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_notifications(&self, project_id: &str) -> CoreResult<Vec<NotificationRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM push_notification WHERE project_id = ?1 ORDER BY created_at, id",
            NOTIFICATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![project_id], notification_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
