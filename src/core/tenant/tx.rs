use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::core::error::{CoreError, CoreResult};

/// An open write transaction on a tenant database.
///
/// Owns the connection lock for its whole lifetime, so it can cross await points
/// while hooks run. Dropping an unfinished transaction rolls it back.
pub struct TenantTx {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl TenantTx {
    pub async fn begin(db: Arc<Mutex<Connection>>) -> CoreResult<Self> {
        let conn = db.lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.finished
    }

    /// Connection for statements inside the transaction. Errors once the transaction has ended.
    pub fn conn(&self) -> CoreResult<&Connection> {
        if self.finished {
            return Err(CoreError::Internal(
                "transaction already finished".to_string(),
            ));
        }
        Ok(&self.conn)
    }

    pub fn commit(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::Internal(
                "transaction already finished".to_string(),
            ));
        }
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }

    /// Rolls back if still open. Safe to call more than once.
    pub fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Rollback failed: {}", e);
        }
    }
}

impl Drop for TenantTx {
    fn drop(&mut self) {
        self.rollback();
    }
}
