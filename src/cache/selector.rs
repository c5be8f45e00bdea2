use super::{DistributedCache, TtlCache};
use crate::config::{CacheSettings, Config};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;

/// Cache used by the market data service: either in-process or Redis-backed.
#[derive(Debug)]
pub enum MarketCache {
    Local(TtlCache<String, Value>),
    Distributed(DistributedCache),
}

impl MarketCache {
    pub fn local(settings: &CacheSettings) -> Self {
        MarketCache::Local(TtlCache::new(settings.ttl(), settings.max_size))
    }

    /// Picks the cache backend from configuration.
    ///
    /// If Redis is requested but cannot be reached, falls back to the local
    /// cache. The fallback is logged, never returned as an error.
    pub async fn select(config: &Config) -> Self {
        if !config.cache.use_redis {
            info!("Using in-process TTL cache (max_size={})", config.cache.max_size);
            return Self::local(&config.cache);
        }
        match DistributedCache::connect(&config.redis, config.cache.ttl()).await {
            Ok(cache) => {
                info!("Using Redis cache at {}", cache.endpoint());
                MarketCache::Distributed(cache)
            }
            Err(e) => {
                warn!("{}. Falling back to in-process TTL cache", e);
                Self::local(&config.cache)
            }
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, MarketCache::Distributed(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MarketCache::Local(_) => "local",
            MarketCache::Distributed(_) => "redis",
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        match self {
            MarketCache::Local(cache) => cache.get(&key.to_string()),
            MarketCache::Distributed(cache) => cache.get_json(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: Value) {
        match self {
            MarketCache::Local(cache) => cache.set(key.to_string(), value),
            MarketCache::Distributed(cache) => cache.set_json(key, &value).await,
        }
    }

    pub async fn get_or_set<F, Fut>(&self, key: &str, factory: F) -> Value
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Value>,
    {
        if let Some(cached) = self.get(key).await {
            return cached;
        }
        let value = factory().await;
        self.set(key, value.clone()).await;
        value
    }

    /// Typed read-through: on a miss (or an undecodable cached value) runs
    /// `factory`, caches its output and returns it. Factory errors are
    /// returned and nothing is cached.
    pub async fn try_get_or_set<T, E, F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            match serde_json::from_value::<T>(cached) {
                Ok(value) => return Ok(value),
                Err(e) => debug!("Discarding undecodable cache entry {}: {}", key, e),
            }
        }
        let value = factory().await?;
        match serde_json::to_value(&value) {
            Ok(encoded) => self.set(key, encoded).await,
            Err(e) => warn!("Could not encode value for cache key {}: {}", key, e),
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_select_local_when_redis_disabled() {
        let config = Config::test_default();
        let cache = MarketCache::select(&config).await;
        assert!(!cache.is_distributed());
        assert_eq!(cache.kind(), "local");
    }

    #[tokio::test]
    async fn test_local_cache_accepts_largest_configured_ttl() {
        let mut config = Config::test_default();
        config.cache.ttl_secs = u64::MAX;
        assert!(config.validate().is_ok());

        let cache = MarketCache::select(&config).await;
        cache.set("k", json!(1)).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_get_or_set_runs_factory_once() {
        let cache = MarketCache::local(&CacheSettings::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_set("markets", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    json!(["BTC/USDT"])
                })
                .await;
            assert_eq!(value, json!(["BTC/USDT"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_get_or_set_typed_round_trip() {
        let cache = MarketCache::local(&CacheSettings::default());
        let first: Result<Vec<u32>, String> =
            cache.try_get_or_set("k", || async { Ok(vec![1, 2, 3]) }).await;
        assert_eq!(first, Ok(vec![1, 2, 3]));

        let second: Result<Vec<u32>, String> = cache
            .try_get_or_set("k", || async { Err("factory must not run".to_string()) })
            .await;
        assert_eq!(second, Ok(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_try_get_or_set_ignores_mistyped_entry() {
        let cache = MarketCache::local(&CacheSettings::default());
        cache.set("k", json!("not a number")).await;
        let value: Result<u64, String> = cache.try_get_or_set("k", || async { Ok(42) }).await;
        assert_eq!(value, Ok(42));
        assert_eq!(cache.get("k").await, Some(json!(42)));
    }
}
