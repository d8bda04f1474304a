use std::sync::Arc;
use tracing::{debug, info};

use super::JobScheduler;
use crate::core::cache::{self, CacheStore, keys};
use crate::core::config::MaintenanceConfig;
use crate::core::error::CoreResult;
use crate::core::store::SystemStore;

/// Drops every cached credential. Live requests repopulate from the system store.
pub async fn flush_tokens(cache: &dyn CacheStore) -> CoreResult<usize> {
    let tokens = cache.delete_prefix(keys::TOKEN_PREFIX).await?;
    let admin = cache.delete_prefix(keys::ADMIN_TOKEN_PREFIX).await?;
    debug!("Flushed {} tenant and {} admin credentials", tokens, admin);
    Ok(tokens + admin)
}

pub async fn flush_queries(cache: &dyn CacheStore) -> CoreResult<usize> {
    let flushed = cache.delete_prefix(keys::QUERY_PREFIX).await?;
    debug!("Flushed {} cached queries", flushed);
    Ok(flushed)
}

/// Copies `user_stats` into `stats:<tenant>` for every active project.
pub async fn load_stats(store: &SystemStore, cache: &dyn CacheStore) -> CoreResult<usize> {
    let all = store.list_stats().await?;
    for stats in &all {
        cache::store(cache, &keys::stats(&stats.project_id), Some(stats)).await?;
    }
    debug!("Loaded usage stats for {} tenants", all.len());
    Ok(all.len())
}

/// Registers the configured maintenance tasks. A task with no cron is left out.
pub async fn register(
    scheduler: &JobScheduler,
    config: &MaintenanceConfig,
    store: SystemStore,
    cache: Arc<dyn CacheStore>,
) -> CoreResult<usize> {
    let mut registered = 0;

    if let Some(cron) = &config.token_flush_cron {
        let cache = cache.clone();
        scheduler
            .schedule_task("token_flush", cron, move || {
                let cache = cache.clone();
                async move { flush_tokens(cache.as_ref()).await.map(|_| ()) }
            })
            .await?;
        registered += 1;
    }

    if let Some(cron) = &config.query_flush_cron {
        let cache = cache.clone();
        scheduler
            .schedule_task("query_flush", cron, move || {
                let cache = cache.clone();
                async move { flush_queries(cache.as_ref()).await.map(|_| ()) }
            })
            .await?;
        registered += 1;
    }

    if let Some(cron) = &config.stats_cron {
        scheduler
            .schedule_task("stats_load", cron, move || {
                let cache = cache.clone();
                let store = store.clone();
                async move { load_stats(&store, cache.as_ref()).await.map(|_| ()) }
            })
            .await?;
        registered += 1;
    }

    info!("Registered {} maintenance tasks", registered);
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{Cached, MemoryCache};
    use crate::core::store::test_store;
    use crate::core::store::types::{DEFAULT_HTTP_REQUESTS_TOTAL, UsageStats};

    #[tokio::test]
    async fn flushes_only_their_own_prefixes() {
        let cache = MemoryCache::new();
        cache.set(&keys::token("p1", "t1"), "{}").await.unwrap();
        cache.set(&keys::admin_token("a"), "{}").await.unwrap();
        cache.set(&keys::query("p1", "q"), "{}").await.unwrap();
        cache.set(&keys::stats("p1"), "{}").await.unwrap();

        assert_eq!(flush_tokens(&cache).await.unwrap(), 2);
        assert_eq!(flush_queries(&cache).await.unwrap(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn stats_load_fills_defaults() {
        let (store, _dir) = test_store().await;
        store.create_project("p1", "Shop", "").await.unwrap();
        let cache = MemoryCache::new();

        assert_eq!(load_stats(&store, &cache).await.unwrap(), 1);
        match cache::lookup::<UsageStats>(&cache, &keys::stats("p1")).await.unwrap() {
            Cached::Present(stats) => {
                assert_eq!(stats.http_requests_total, DEFAULT_HTTP_REQUESTS_TOTAL);
                assert_eq!(stats.http_requests_used, 0);
            }
            _ => panic!("stats were not cached"),
        }
    }
}
