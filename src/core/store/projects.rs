use rusqlite::{OptionalExtension, params};

use super::types::ProjectRecord;
use super::{SystemStore, new_id, now_ts};
use crate::core::error::CoreResult;

impl SystemStore {
    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        data_store_name: &str,
    ) -> CoreResult<ProjectRecord> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO project (id, project_key, name, data_store_name, status, created_at)
             VALUES (?1, ?1, ?2, ?3, 0, ?4)",
            params![id, name, data_store_name, now_ts()],
        )?;
        Ok(ProjectRecord {
            id: id.to_string(),
            project_key: id.to_string(),
            name: name.to_string(),
            data_store_name: data_store_name.to_string(),
            data_store_path: String::new(),
        })
    }

    pub async fn save_data_store(&self, name: &str, path: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO data_store (id, data_store_name, path, status, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT(data_store_name) DO UPDATE SET path = excluded.path",
            params![new_id(), name, path, now_ts()],
        )?;
        Ok(())
    }

    /// Active project with the directory of its data store resolved.
    pub async fn find_project(&self, id: &str) -> CoreResult<Option<ProjectRecord>> {
        let db = self.db.lock().await;
        let project = db
            .query_row(
                "SELECT project.id, project.project_key, project.name, project.data_store_name,
                        COALESCE(data_store.path, '')
                 FROM project
                 LEFT JOIN data_store
                   ON data_store.data_store_name = project.data_store_name AND data_store.status = 0
                 WHERE project.id = ?1 AND project.status = 0",
                params![id],
                |row| {
                    Ok(ProjectRecord {
                        id: row.get(0)?,
                        project_key: row.get(1)?,
                        name: row.get(2)?,
                        data_store_name: row.get(3)?,
                        data_store_path: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }
}
