use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::auth::Authenticator;
use crate::core::cache::{CacheStore, MemoryCache, SqliteCache};
use crate::core::catalog::DefinitionCatalog;
use crate::core::config::Config;
use crate::core::interceptor::standard_registry;
use crate::core::jobs::JobScheduler;
use crate::core::operator::DataOperator;
use crate::core::outbound::WebhookClient;
use crate::core::store::SystemStore;
use crate::core::tenant::TenantRegistry;

/// Every long-lived component, wired once from the configuration.
pub(crate) struct Runtime {
    pub store: SystemStore,
    pub cache: Arc<dyn CacheStore>,
    pub scheduler: Option<Arc<JobScheduler>>,
    pub operator: Arc<DataOperator>,
    pub authenticator: Authenticator,
}

pub(crate) async fn open_store(config: &Config) -> Result<SystemStore> {
    let path = config.storage.system_db_path();
    SystemStore::open(&path)
        .await
        .with_context(|| format!("Failed to open system store at {}", path.display()))
}

fn open_cache(config: &Config) -> Result<Arc<dyn CacheStore>> {
    match config.storage.cache_db_path() {
        Some(path) => {
            let cache = SqliteCache::open(&path)
                .with_context(|| format!("Failed to open cache at {}", path.display()))?;
            info!("Shared cache at {}", path.display());
            Ok(Arc::new(cache))
        }
        None => {
            info!("Using an in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

impl Runtime {
    /// `with_jobs` decides whether this process owns the job scheduler.
    pub(crate) async fn build(config: &Config, with_jobs: bool) -> Result<Self> {
        let store = open_store(config).await?;
        let cache = open_cache(config)?;
        let catalog = DefinitionCatalog::new(store.clone(), cache.clone());
        let tenants = Arc::new(TenantRegistry::new(store.clone(), config.storage.tenants_dir()));

        let client = WebhookClient::new(
            Duration::from_secs(config.webhooks.timeout_secs),
            config.webhooks.max_response_bytes,
        )
        .context("Failed to build the webhook client")?;
        let registry = Arc::new(standard_registry(&catalog, client));
        info!("Interceptor registry holds {} hooks", registry.len());

        let scheduler = if with_jobs {
            let scheduler = JobScheduler::new(store.clone(), tenants.clone(), config.jobs.overlap)
                .await
                .context("Failed to create the job scheduler")?;
            Some(Arc::new(scheduler))
        } else {
            info!("Job scheduling disabled on this node");
            None
        };

        let operator = Arc::new(DataOperator::new(tenants, catalog, registry, scheduler.clone()));
        let authenticator = Authenticator::new(store.clone(), cache.clone());

        Ok(Self {
            store,
            cache,
            scheduler,
            operator,
            authenticator,
        })
    }
}
