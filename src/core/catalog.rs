use std::sync::Arc;
use tracing::debug;

use crate::core::cache::{self, CacheStore, Cached, keys};
use crate::core::error::CoreResult;
use crate::core::store::SystemStore;
use crate::core::store::types::{DeliveryMode, InterceptorDefinition, Phase, QueryRecord};

/// Cache-first access to tenant definitions (named queries and interceptors).
///
/// A miss always goes to the system store, and what the store says, including "no
/// such row", is written back before returning.
#[derive(Clone)]
pub struct DefinitionCatalog {
    store: SystemStore,
    cache: Arc<dyn CacheStore>,
}

impl DefinitionCatalog {
    pub fn new(store: SystemStore, cache: Arc<dyn CacheStore>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &SystemStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub async fn query(&self, tenant_id: &str, name: &str) -> CoreResult<Option<QueryRecord>> {
        let key = keys::query(tenant_id, name);
        match cache::lookup::<QueryRecord>(self.cache.as_ref(), &key).await? {
            Cached::Present(q) => return Ok(Some(q)),
            Cached::Absent => return Ok(None),
            Cached::Miss => {}
        }
        debug!("Query cache miss for {}", key);
        let loaded = self.store.find_query(tenant_id, name).await?;
        cache::store(self.cache.as_ref(), &key, loaded.as_ref()).await?;
        Ok(loaded)
    }

    pub async fn interceptor(
        &self,
        mode: DeliveryMode,
        tenant_id: &str,
        target: &str,
        phase: Phase,
        action: &str,
    ) -> CoreResult<Option<InterceptorDefinition>> {
        let key = keys::interceptor(mode, tenant_id, target, phase, action);
        match cache::lookup::<InterceptorDefinition>(self.cache.as_ref(), &key).await? {
            Cached::Present(def) => return Ok(Some(def)),
            Cached::Absent => return Ok(None),
            Cached::Miss => {}
        }
        debug!("Interceptor cache miss for {}", key);
        let loaded = self
            .store
            .find_interceptor(mode, tenant_id, target, phase, action)
            .await?;
        cache::store(self.cache.as_ref(), &key, loaded.as_ref()).await?;
        Ok(loaded)
    }
}
