use serde_json::{Map, Value};

use crate::core::auth::Identity;
use crate::core::error::CoreResult;
use crate::core::executor::ContextVars;
use crate::core::store::ADMIN_TENANT;
use crate::core::store::types::NewNotification;
use crate::core::tenant::TenantTx;

/// Side effects that must only happen once the request's transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    Invalidate(String),
    SyncJob(String),
    Notify(NewNotification),
}

/// Everything one request carries through the pipeline. Owned by that request alone.
pub struct ExecutionContext {
    pub identity: Identity,
    pub tenant_id: String,
    pub client_ip: Option<String>,
    /// Values interceptors hand to later interceptors of the same call.
    pub values: Map<String, Value>,
    tx: TenantTx,
    deferred: Vec<Deferred>,
}

impl ExecutionContext {
    pub fn new(identity: Identity, client_ip: Option<String>, tx: TenantTx) -> Self {
        Self {
            tenant_id: identity.tenant_id.clone(),
            identity,
            client_ip,
            values: Map::new(),
            tx,
            deferred: Vec::new(),
        }
    }

    pub fn tx(&mut self) -> &mut TenantTx {
        &mut self.tx
    }

    pub fn vars(&self) -> ContextVars {
        ContextVars::for_caller(&self.identity, self.client_ip.as_deref())
    }

    pub fn is_admin_tenant(&self) -> bool {
        self.tenant_id == ADMIN_TENANT
    }

    pub fn defer(&mut self, effect: Deferred) {
        if !self.deferred.contains(&effect) {
            self.deferred.push(effect);
        }
    }

    pub fn rollback(&mut self) {
        self.tx.rollback();
    }

    /// Commits and hands back the deferred effects for the caller to apply.
    pub fn commit(mut self) -> CoreResult<Vec<Deferred>> {
        self.tx.commit()?;
        Ok(std::mem::take(&mut self.deferred))
    }
}
