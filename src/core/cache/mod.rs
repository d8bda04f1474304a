pub mod keys;
mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::core::error::CoreResult;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Shared key/value store for credentials, interceptor and query definitions.
///
/// Entries never expire on their own. Whoever mutates a backing row deletes the key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn delete(&self, key: &str) -> CoreResult<bool>;
    async fn delete_prefix(&self, prefix: &str) -> CoreResult<usize>;
}

/// Result of a typed lookup. `Absent` is a cached confirmation that no row exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached<T> {
    Miss,
    Absent,
    Present(T),
}

pub async fn lookup<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> CoreResult<Cached<T>> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(Cached::Miss);
    };
    match serde_json::from_str::<Option<T>>(&raw) {
        Ok(Some(value)) => Ok(Cached::Present(value)),
        Ok(None) => Ok(Cached::Absent),
        Err(e) => {
            warn!("Dropping unreadable cache entry '{}': {}", key, e);
            cache.delete(key).await?;
            Ok(Cached::Miss)
        }
    }
}

/// Writes `value`, or a negative entry for `None`.
pub async fn store<T: Serialize>(cache: &dyn CacheStore, key: &str, value: Option<&T>) -> CoreResult<()> {
    let raw = serde_json::to_string(&value)?;
    cache.set(key, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        v: i32,
    }

    #[tokio::test]
    async fn typed_lookup_distinguishes_miss_and_absent() {
        let cache = MemoryCache::new();
        assert_eq!(lookup::<Sample>(&cache, "k").await.unwrap(), Cached::Miss);

        store::<Sample>(&cache, "k", None).await.unwrap();
        assert_eq!(lookup::<Sample>(&cache, "k").await.unwrap(), Cached::Absent);

        store(&cache, "k", Some(&Sample { v: 3 })).await.unwrap();
        assert_eq!(
            lookup::<Sample>(&cache, "k").await.unwrap(),
            Cached::Present(Sample { v: 3 })
        );
    }

    #[tokio::test]
    async fn unreadable_entry_is_a_miss() {
        let cache = MemoryCache::new();
        cache.set("k", "{not json").await.unwrap();
        assert_eq!(lookup::<Sample>(&cache, "k").await.unwrap(), Cached::Miss);
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
