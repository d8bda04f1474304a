use rusqlite::{OptionalExtension, params};

use super::types::{Delivery, DeliveryMode, InterceptorDefinition, Phase};
use super::{SystemStore, new_id, now_ts};
use crate::core::error::{CoreError, CoreResult};

impl SystemStore {
    /// Exact (tenant, target, phase, action) lookup in the table for `mode`.
    pub async fn find_interceptor(
        &self,
        mode: DeliveryMode,
        tenant_id: &str,
        target: &str,
        phase: Phase,
        action: &str,
    ) -> CoreResult<Option<InterceptorDefinition>> {
        let db = self.db.lock().await;
        let found = match mode {
            DeliveryMode::Local => db
                .query_row(
                    "SELECT id, criteria, callback FROM local_interceptor
                     WHERE project_id = ?1 AND target = ?2 AND type = ?3 AND action_type = ?4
                     ORDER BY created_at LIMIT 1",
                    params![tenant_id, target, phase.as_str(), action],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            Delivery::Local {
                                callback: row.get(2)?,
                            },
                        ))
                    },
                )
                .optional()?,
            DeliveryMode::Remote => db
                .query_row(
                    "SELECT id, criteria, method, url, callback FROM remote_interceptor
                     WHERE project_id = ?1 AND target = ?2 AND type = ?3 AND action_type = ?4
                     ORDER BY created_at LIMIT 1",
                    params![tenant_id, target, phase.as_str(), action],
                    |row| {
                        let callback: String = row.get(4)?;
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            Delivery::Remote {
                                method: row.get(2)?,
                                url: row.get(3)?,
                                callback: (!callback.trim().is_empty()).then_some(callback),
                            },
                        ))
                    },
                )
                .optional()?,
        };

        Ok(found.map(|(id, criteria, delivery)| InterceptorDefinition {
            id,
            tenant_id: tenant_id.to_string(),
            target: target.to_string(),
            phase,
            action: action.to_string(),
            criteria,
            delivery,
        }))
    }

    pub async fn save_interceptor(
        &self,
        def: &InterceptorDefinition,
    ) -> CoreResult<InterceptorDefinition> {
        if def.target.trim().is_empty() || def.action.trim().is_empty() {
            return Err(CoreError::Validation(
                "interceptor target and action are required".to_string(),
            ));
        }
        let mut saved = def.clone();
        if saved.id.is_empty() {
            saved.id = new_id();
        }

        let db = self.db.lock().await;
        match &saved.delivery {
            Delivery::Local { callback } => {
                db.execute(
                    "INSERT OR REPLACE INTO local_interceptor
                     (id, project_id, target, type, action_type, criteria, callback, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        saved.id,
                        saved.tenant_id,
                        saved.target,
                        saved.phase.as_str(),
                        saved.action,
                        saved.criteria,
                        callback,
                        now_ts()
                    ],
                )?;
            }
            Delivery::Remote {
                method,
                url,
                callback,
            } => {
                db.execute(
                    "INSERT OR REPLACE INTO remote_interceptor
                     (id, project_id, target, type, action_type, method, url, criteria, callback, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        saved.id,
                        saved.tenant_id,
                        saved.target,
                        saved.phase.as_str(),
                        saved.action,
                        method,
                        url,
                        saved.criteria,
                        callback.clone().unwrap_or_default(),
                        now_ts()
                    ],
                )?;
            }
        }
        Ok(saved)
    }
}
