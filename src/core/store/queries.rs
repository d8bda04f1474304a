use rusqlite::{OptionalExtension, params};

use super::types::QueryRecord;
use super::{SystemStore, new_id, now_ts};
use crate::core::error::CoreResult;

impl SystemStore {
    pub async fn save_query(&self, project_id: &str, name: &str, script: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO query (id, project_id, name, script, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_id, name) DO UPDATE SET script = excluded.script",
            params![new_id(), project_id, name, script, now_ts()],
        )?;
        Ok(())
    }

    pub async fn find_query(&self, project_id: &str, name: &str) -> CoreResult<Option<QueryRecord>> {
        let db = self.db.lock().await;
        let query = db
            .query_row(
                "SELECT id, project_id, name, script FROM query WHERE project_id = ?1 AND name = ?2",
                params![project_id, name],
                |row| {
                    Ok(QueryRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                        script: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(query)
    }
}
