use rusqlite::{OptionalExtension, params};

use super::types::{TokenRecord, UserRecord};
use super::{SystemStore, new_id, now_ts};
use crate::core::error::CoreResult;

fn generate_token_key() -> String {
    let bytes: [u8; 24] = rand::random();
    format!("tdk_{}", hex::encode(bytes))
}

impl SystemStore {
    pub async fn create_user(&self, email: &str) -> CoreResult<UserRecord> {
        let user = UserRecord {
            id: new_id(),
            email: email.to_string(),
            token_key: generate_token_key(),
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO user (id, email, token_key, status, created_at) VALUES (?1, ?2, ?3, 0, ?4)",
            params![user.id, user.email, user.token_key, now_ts()],
        )?;
        Ok(user)
    }

    /// Active user owning the given secret. Backs administrative-tenant authentication.
    pub async fn find_user_by_token_key(&self, token_key: &str) -> CoreResult<Option<UserRecord>> {
        let db = self.db.lock().await;
        let user = db
            .query_row(
                "SELECT id, email, token_key FROM user WHERE token_key = ?1 AND status = 0",
                params![token_key],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        token_key: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Active user whose secret is `token_key` and who is a member of an active `project_id`.
    pub async fn find_member(
        &self,
        project_id: &str,
        token_key: &str,
    ) -> CoreResult<Option<UserRecord>> {
        let db = self.db.lock().await;
        let user = db
            .query_row(
                "SELECT user.id, user.email, user.token_key FROM user
                 INNER JOIN user_project ON user.email = user_project.user_email
                 INNER JOIN project ON project.id = user_project.project_id
                 WHERE user.token_key = ?1 AND user.status = 0
                   AND user_project.project_id = ?2 AND project.status = 0",
                params![token_key, project_id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        token_key: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub async fn add_member(&self, email: &str, project_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO user_project (id, user_email, project_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![new_id(), email, project_id, now_ts()],
        )?;
        Ok(())
    }

    pub async fn create_token(
        &self,
        project_id: &str,
        token: &str,
        targets: &str,
        mode: &str,
    ) -> CoreResult<TokenRecord> {
        let record = TokenRecord {
            id: new_id(),
            project_id: project_id.to_string(),
            token: token.to_string(),
            name: String::new(),
            targets: targets.to_string(),
            mode: mode.to_string(),
            user_id: String::new(),
            user_email: String::new(),
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO token (id, project_id, token, name, targets, mode, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                record.id,
                record.project_id,
                record.token,
                record.name,
                record.targets,
                record.mode,
                now_ts()
            ],
        )?;
        Ok(record)
    }

    pub async fn find_token(&self, project_id: &str, token: &str) -> CoreResult<Option<TokenRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT id, project_id, token, name, targets, mode, user_id, user_email
                 FROM token WHERE project_id = ?1 AND token = ?2 AND status = 0",
                params![project_id, token],
                |row| {
                    Ok(TokenRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        token: row.get(2)?,
                        name: row.get(3)?,
                        targets: row.get(4)?,
                        mode: row.get(5)?,
                        user_id: row.get(6)?,
                        user_email: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
