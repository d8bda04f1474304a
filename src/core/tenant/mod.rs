mod tx;

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::{CoreError, CoreResult};
use crate::core::store::{ADMIN_TENANT, SystemStore, open_connection};

pub use tx::TenantTx;

pub type TenantDb = Arc<Mutex<Connection>>;

/// Opens and keeps one connection per tenant database.
///
/// The administrative tenant gets its own connection to the system store file, so a
/// request transaction there never blocks lookups made through `SystemStore`.
pub struct TenantRegistry {
    store: SystemStore,
    tenants_dir: PathBuf,
    conns: Mutex<HashMap<String, TenantDb>>,
}

impl TenantRegistry {
    pub fn new(store: SystemStore, tenants_dir: PathBuf) -> Self {
        Self {
            store,
            tenants_dir,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an already-open database for a tenant.
    pub async fn register(&self, tenant_id: &str, db: TenantDb) {
        self.conns.lock().await.insert(tenant_id.to_string(), db);
    }

    pub async fn connection(&self, tenant_id: &str) -> CoreResult<TenantDb> {
        let mut conns = self.conns.lock().await;
        if let Some(db) = conns.get(tenant_id) {
            return Ok(db.clone());
        }

        let path = if tenant_id == ADMIN_TENANT {
            self.store.path().to_path_buf()
        } else {
            let project = self
                .store
                .find_project(tenant_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("Unknown tenant: {}", tenant_id)))?;
            let dir = if project.data_store_path.trim().is_empty() {
                self.tenants_dir.clone()
            } else {
                PathBuf::from(project.data_store_path.trim())
            };
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| CoreError::Internal(format!("{}: {}", dir.display(), e)))?;
            dir.join(format!("{}.db", project.project_key))
        };

        let db = Arc::new(Mutex::new(open_connection(&path)?));
        info!("Opened database for tenant '{}' at {}", tenant_id, path.display());
        conns.insert(tenant_id.to_string(), db.clone());
        Ok(db)
    }

    pub async fn begin(&self, tenant_id: &str) -> CoreResult<TenantTx> {
        let db = self.connection(tenant_id).await?;
        TenantTx::begin(db).await
    }
}
