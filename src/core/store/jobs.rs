use rusqlite::{OptionalExtension, Row, params};

use super::types::{JobRecord, JobStatus};
use super::{SystemStore, new_id, now_ts};
use crate::core::error::CoreResult;

const JOB_COLUMNS: &str = "id, project_id, name, mode, cron, script, loop_script, status";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let loop_script: Option<String> = row.get(6)?;
    Ok(JobRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        mode: row.get(3)?,
        cron: row.get(4)?,
        script: row.get(5)?,
        loop_script: loop_script.filter(|s| !s.trim().is_empty()),
        status: JobStatus::from_status(&row.get::<_, String>(7)?),
    })
}

impl SystemStore {
    pub async fn find_job(&self, id: &str) -> CoreResult<Option<JobRecord>> {
        let db = self.db.lock().await;
        let job = db
            .query_row(
                &format!("SELECT {} FROM job WHERE id = ?1", JOB_COLUMNS),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> CoreResult<Vec<JobRecord>> {
        let db = self.db.lock().await;
        let mut jobs = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM job WHERE status = ?1 ORDER BY created_at",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str()], job_from_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt =
                    db.prepare(&format!("SELECT {} FROM job ORDER BY created_at", JOB_COLUMNS))?;
                let rows = stmt.query_map([], job_from_row)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub async fn save_job(&self, job: &JobRecord) -> CoreResult<JobRecord> {
        let mut saved = job.clone();
        if saved.id.is_empty() {
            saved.id = new_id();
        }
        let now = now_ts();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO job (id, project_id, name, mode, cron, script, loop_script, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id, name = excluded.name, mode = excluded.mode,
                cron = excluded.cron, script = excluded.script, loop_script = excluded.loop_script,
                status = excluded.status, updated_at = excluded.updated_at",
            params![
                saved.id,
                saved.project_id,
                saved.name,
                saved.mode,
                saved.cron,
                saved.script,
                saved.loop_script,
                saved.status.as_str(),
                now
            ],
        )?;
        Ok(saved)
    }

    /// Moves a job from `from` to `to`. Returns false if the job was not in `from`.
    pub async fn set_job_status(&self, id: &str, from: JobStatus, to: JobStatus) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE job SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now_ts(), id, from.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub async fn delete_job(&self, id: &str) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM job WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
