mod policy;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::core::cache::{self, CacheStore, Cached, keys};
use crate::core::error::{CoreError, CoreResult};
use crate::core::store::{ADMIN_TENANT, SystemStore};

pub use policy::check_access_permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// A system user authenticated against the administrative tenant.
    Admin,
    /// An explicit per-tenant token row.
    Token,
    /// A registered member of the tenant, without a token row.
    Member,
    /// Work started by the process itself, such as a scheduled job.
    System,
}

/// The credential record a token resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub subject_code: String,
    pub scope_mode: String,
    pub targets: String,
    pub tenant_id: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn system(tenant_id: &str) -> Self {
        Self {
            subject_id: "system".to_string(),
            subject_code: "system".to_string(),
            scope_mode: "rwx".to_string(),
            targets: "*".to_string(),
            tenant_id: tenant_id.to_string(),
            kind: IdentityKind::System,
        }
    }

    pub fn allows(&self, resource: &str, required_ops: &str) -> bool {
        check_access_permission(&self.targets, resource, &self.scope_mode, required_ops)
    }
}

/// Resolves `(tenant, token)` pairs to identities: shared cache first, system store on a miss.
#[derive(Clone)]
pub struct Authenticator {
    store: SystemStore,
    cache: Arc<dyn CacheStore>,
}

impl Authenticator {
    pub fn new(store: SystemStore, cache: Arc<dyn CacheStore>) -> Self {
        Self { store, cache }
    }

    pub async fn authenticate(&self, tenant_id: &str, token: &str) -> CoreResult<Identity> {
        if tenant_id.trim().is_empty() || token.trim().is_empty() {
            return Err(CoreError::authentication_failed());
        }

        let key = if tenant_id == ADMIN_TENANT {
            keys::admin_token(token)
        } else {
            keys::token(tenant_id, token)
        };

        if let Cached::Present(identity) = cache::lookup::<Identity>(self.cache.as_ref(), &key).await? {
            if identity.tenant_id == tenant_id {
                return Ok(identity);
            }
        }

        debug!("Credential cache miss for tenant '{}'", tenant_id);
        let identity = if tenant_id == ADMIN_TENANT {
            self.load_admin(token).await?
        } else {
            self.load_tenant(tenant_id, token).await?
        };

        match identity {
            Some(identity) => {
                cache::store(self.cache.as_ref(), &key, Some(&identity)).await?;
                Ok(identity)
            }
            None => Err(CoreError::authentication_failed()),
        }
    }

    /// Authenticates, then requires `required_ops` on `resource`.
    pub async fn check_access(
        &self,
        tenant_id: &str,
        token: &str,
        resource: &str,
        required_ops: &str,
    ) -> CoreResult<Identity> {
        let identity = self.authenticate(tenant_id, token).await?;
        if identity.allows(resource, required_ops) {
            Ok(identity)
        } else {
            Err(CoreError::access_denied())
        }
    }

    async fn load_admin(&self, token: &str) -> CoreResult<Option<Identity>> {
        let user = self.store.find_user_by_token_key(token).await?;
        Ok(user.map(|u| Identity {
            subject_id: u.id,
            subject_code: u.email,
            scope_mode: "rwx".to_string(),
            targets: "*".to_string(),
            tenant_id: ADMIN_TENANT.to_string(),
            kind: IdentityKind::Admin,
        }))
    }

    async fn load_tenant(&self, tenant_id: &str, token: &str) -> CoreResult<Option<Identity>> {
        if let Some(row) = self.store.find_token(tenant_id, token).await? {
            return Ok(Some(Identity {
                subject_id: row.user_id,
                subject_code: row.user_email,
                scope_mode: row.mode,
                targets: row.targets,
                tenant_id: tenant_id.to_string(),
                kind: IdentityKind::Token,
            }));
        }

        let member = self.store.find_member(tenant_id, token).await?;
        Ok(member.map(|u| Identity {
            subject_id: u.id,
            subject_code: u.email,
            scope_mode: "rwx".to_string(),
            targets: "*".to_string(),
            tenant_id: tenant_id.to_string(),
            kind: IdentityKind::Member,
        }))
    }
}
